//! Tower layers of the client stack
//!
//! - [`CookieLayer`] keeps a per-client cookie jar
//! - [`RedirectPolicy`] drives `tower_http`'s `FollowRedirect`

mod cookie_jar;
mod redirect;

pub use cookie_jar::{CookieJar, CookieLayer, CookieService};
pub use redirect::RedirectPolicy;
