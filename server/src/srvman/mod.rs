//! Blue/green process supervision
//!
//! A [`Group`] starts one [`Service`] per [`ServiceConfig`], all bound to the same [`Color`].
//! Placeholders of the form `[[bluegreen.KEY]]` in a config are filled from the map for that
//! color, so two groups of the same application can run side by side during a deploy.

pub mod color;
pub mod config;
pub mod group;
pub mod service;

pub use color::Color;
pub use config::{interpolate, HealthCheckConfig, ResolvedService, ServiceConfig};
pub use group::Group;
pub use service::Service;
