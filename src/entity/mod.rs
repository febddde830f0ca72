//! Entities for the externally managed trip schema. Geometry columns are not
//! mapped; they are read with `ST_X`/`ST_Y` and written as EWKT.

pub mod point;
pub mod route_leg;
pub mod route_tracepoint;
pub mod trip;
