// Warp error handling and propagation
// Courtesy of https://github.com/seanmonstar/warp/pull/909#issuecomment-1184854848
//
// Usage:
//
//   1) A handler function, instead of returning a Warp reply/rejection, returns a
//   `Result<Reply, ApiError>.`
//
//   This is because rejections are meant to say "this filter can't handle this request, but maybe
//   some other can" (see https://github.com/seanmonstar/warp/issues/388#issuecomment-576453485).
//   A rejection means Warp will fall through to another filter and ultimately hit a rejection
//   handler, with people reporting rejections take way too long to process with more routes.
//
//   In our case, the error in our handler function is final and we also would like to be able
//   to use the ? operator to bail out of the handler if an error exists, which using a Result type
//   handles for us.
//
//   2) ApiError knows how to convert itself to an HTTP response + status code (error-specific), allowing
//   us to implement Reply for ApiError.
//
//   3) We can't implement Reply for Result<Reply, Reply> (we don't control Result), so we have to
//   add a final function `into_response` that converts our Result into a Response. We won't need
//   to do this when https://github.com/seanmonstar/warp/pull/909 is merged:
//
//   ```
//   .then(my_handler_func)
//   .map(into_response)
//   ```
//

use warp::hyper::{Body, Response, StatusCode};
use warp::Reply;

use crate::catalog::CatalogError;
use crate::connection::ConnectionError;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden,
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

// Wrap catalog errors so handlers can bail out with the ? operator
impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::UserAlreadyExists { .. } => ApiError::Conflict(err.to_string()),
            CatalogError::UserDoesNotExist { .. } | CatalogError::InvalidSession => {
                ApiError::Unauthorized
            }
            CatalogError::NotAMember => ApiError::Forbidden,
            CatalogError::ProjectDoesNotExist { .. }
            | CatalogError::SchemaDoesNotExist { .. }
            | CatalogError::TableDoesNotExist { .. } => ApiError::NotFound(err.to_string()),
            CatalogError::SqlxError(e) => ApiError::Internal(e.to_string()),
        }
    }
}

// Descriptor and probe failures are the client's problem: a bad or
// unreachable connection string in the request
impl From<ConnectionError> for ApiError {
    fn from(err: ConnectionError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl ApiError {
    fn status_code_body(self: ApiError) -> (StatusCode, String) {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED".to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN".to_string()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        }
    }
}

impl Reply for ApiError {
    fn into_response(self) -> Response<Body> {
        let (status, body) = self.status_code_body();
        Response::builder()
            .status(status)
            .body(body.into())
            .expect("Could not construct Response")
    }
}

pub fn into_response<S: Reply, E: Reply>(reply_res: Result<S, E>) -> Response<Body> {
    match reply_res {
        Ok(resp) => resp.into_response(),
        Err(err) => err.into_response(),
    }
}
