//! Map matching for submitted cycling trips: GPS trace simplification,
//! serialized dispatch to an OSRM routing engine, route leg shaping with
//! speed outlier flags, and legend classification for the explore map.

pub mod distribution;
pub mod entity;
pub mod model;
pub mod osrm;
pub mod outliers;
pub mod point_filter;
pub mod routing;
pub mod store;
pub mod task_queue;
pub mod trip_matcher;
pub mod trip_processor;
