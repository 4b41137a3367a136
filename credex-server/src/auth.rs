//! `Authorization: Bearer` credential extraction.

use axum::extract::{FromRequestParts, OptionalFromRequestParts};
use credex::account::Credential;
use credex::error::CreditError;
use http::header::AUTHORIZATION;
use http::request::Parts;

use crate::error::ApiError;

/// A credential presented as `Authorization: Bearer <credential>`.
///
/// Use `Option<Bearer>` where a credential is optional. A present but
/// malformed header is rejected either way.
#[derive(Debug, Clone)]
pub struct Bearer(pub Credential);

fn parse(parts: &Parts) -> Result<Option<Bearer>, ApiError> {
    let Some(value) = parts.headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let malformed = || ApiError(CreditError::Unauthorized("malformed authorization header".into()));
    let value = value.to_str().map_err(|_| malformed())?;
    let token = value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(malformed)?;
    Ok(Some(Bearer(Credential::from_presented(token))))
}

impl<S: Send + Sync> FromRequestParts<S> for Bearer {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parse(parts)?.ok_or_else(|| {
            ApiError(CreditError::Unauthorized("missing bearer credential".into()))
        })
    }
}

impl<S: Send + Sync> OptionalFromRequestParts<S> for Bearer {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Option<Self>, Self::Rejection> {
        parse(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn parts(header: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/");
        if let Some(h) = header {
            builder = builder.header(AUTHORIZATION, h);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_parse_bearer() {
        let bearer = parse(&parts(Some("Bearer cx_abc"))).unwrap().unwrap();
        assert_eq!(bearer.0.expose(), "cx_abc");
        assert!(parse(&parts(None)).unwrap().is_none());
        assert!(parse(&parts(Some("Basic dXNlcg=="))).is_err());
        assert!(parse(&parts(Some("Bearer "))).is_err());
    }
}
