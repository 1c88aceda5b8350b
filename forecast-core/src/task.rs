//! Schedulable fetch units.
//!
//! Each task has a "fan-in" form that does no work and only exists to be
//! depended upon: a [`ForecastFetchTask`] without a URL and a
//! [`SiteFetchTask`] without coordinates both complete with no result right away.

pub mod forecast;
pub mod site;

pub use forecast::ForecastFetchTask;
pub use site::SiteFetchTask;
