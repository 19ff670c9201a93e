mod error;
mod not_found;

pub use error::{error_response, status_for, ErrorBody};
pub use not_found::not_found_handler;
