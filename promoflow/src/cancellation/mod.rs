//! Cooperative cancellation for runs being driven.

mod token;

pub use token::CancellationToken;
