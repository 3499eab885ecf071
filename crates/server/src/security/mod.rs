//! Stateless request guards for the browser-facing forms.

pub mod csrf;
pub mod redirect;

pub use csrf::{CsrfError, CsrfGuard};
pub use redirect::is_server_relative_url;
