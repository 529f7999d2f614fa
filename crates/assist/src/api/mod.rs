//! HTTP API module.
//!
//! Chat streaming endpoints push `text/event-stream` frames; everything else
//! is JSON except the PDF report download.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, EXPORT_FAILURE_MESSAGE, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
