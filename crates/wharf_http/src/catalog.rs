//! `/v2/_catalog`: the paginated repository listing, filtered to what the
//! bearer may pull.

use axum::response::{IntoResponse, Response};
use axum::Json;
use http::{Request, StatusCode};
use hyper::body::Body;
use serde::Serialize;

use super::tags::clamp_page_size;
use super::{query_map, respond, Wharf};

#[derive(Serialize)]
struct CatalogResponse {
    repositories: Vec<String>,
}

pub(crate) async fn get_catalog(wharf: Wharf, req: Request<Body>) -> Response {
    let ctx = match wharf.authorizer().authorize_catalog(req.headers()) {
        Ok(ctx) => ctx,
        Err(response) => return response,
    };

    respond(async {
        let params = query_map(req.uri());
        let n = clamp_page_size(params.get("n").and_then(|v| v.parse::<i64>().ok()));
        let last = params.get("last").map(String::as_str);

        // over-fetch so permission filtering still fills the page where
        // possible; the listing is name-ordered, which keeps repeated calls
        // with identical parameters stable
        let names = wharf.manager().catalog(n * 4, last).await?;
        let visible = wharf
            .authorizer()
            .policy
            .filter_pullable(ctx.subject(), names);
        let repositories: Vec<String> = visible.into_iter().take(n as usize).collect();

        Ok((StatusCode::OK, Json(CatalogResponse { repositories })).into_response())
    }
    .await)
}
