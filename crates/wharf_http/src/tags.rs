//! `/v2/<name>/tags/list` with `n`/`last` pagination.

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::{Request, StatusCode};
use hyper::body::Body;

use wharf_core::model::TagList;
use wharf_token::Action;

use super::{query_map, respond, Wharf};

const DEFAULT_PAGE_SIZE: i64 = 100;
const MAX_PAGE_SIZE: i64 = 1000;

/// Negative or missing `n` falls back to the default; excessive `n` is
/// clamped.
pub(crate) fn clamp_page_size(n: Option<i64>) -> i64 {
    match n {
        Some(n) if n > MAX_PAGE_SIZE => MAX_PAGE_SIZE,
        Some(n) if n > 0 => n,
        _ => DEFAULT_PAGE_SIZE,
    }
}

pub(crate) async fn get_tags(wharf: Wharf, req: Request<Body>, name: String) -> Response {
    if let Err(response) = wharf
        .authorizer()
        .authorize_repository(req.headers(), &name, Action::Pull)
    {
        return response;
    }

    respond(async {
        let view = wharf.resolve_view(&name).await?;
        let store = view.store()?;

        let params = query_map(req.uri());
        let n = clamp_page_size(params.get("n").and_then(|v| v.parse::<i64>().ok()));
        let last = params.get("last").map(String::as_str);

        let tags = store
            .version_store()
            .tags(view.version, Some(n), last)
            .await?;

        let body = TagList {
            name: view.requested.clone(),
            tags: tags.into_iter().map(|t| t.name).collect(),
        };
        Ok((StatusCode::OK, Json(body)).into_response())
    }
    .await)
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::missing(None, 100)]
    #[case::negative(Some(-5), 100)]
    #[case::zero(Some(0), 100)]
    #[case::normal(Some(25), 25)]
    #[case::excessive(Some(100_000), 1000)]
    fn page_size_clamping(#[case] n: Option<i64>, #[case] expected: i64) {
        assert_eq!(clamp_page_size(n), expected);
    }
}
