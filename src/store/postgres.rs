use anyhow::{Context, Result};
use chrono::Utc;
use geo::Point;
use log::debug;
use sea_orm::sea_query::{Alias, DynIden, Expr, IntoIden, Query, SimpleExpr};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, Database,
    DatabaseConnection, EntityTrait, FromQueryResult, Order, QueryFilter, QueryOrder, QuerySelect,
    prelude::DateTimeWithTimeZone,
};

use super::TripStore;
use crate::entity::{point, route_leg, route_tracepoint, trip};
use crate::model::{
    RouteLeg, RouteTracepoint, Trip, TripId, TripPoint, TripStatus, linestring_ewkt, point_ewkt,
};

/// Trip storage in the shared PostGIS database
#[derive(Debug, Clone)]
pub struct PgTripStore {
    db: DatabaseConnection,
}

#[derive(Debug, FromQueryResult)]
struct PointRow {
    id: i32,
    trip_id: i32,
    accuracy: f64,
    altitude: Option<f64>,
    heading: Option<f64>,
    moving: Option<bool>,
    speed: Option<f64>,
    time: DateTimeWithTimeZone,
    activity: Option<i32>,
    confidence: Option<i32>,
    longitude: f64,
    latitude: f64,
}

impl From<PointRow> for TripPoint {
    fn from(row: PointRow) -> Self {
        Self {
            id: row.id,
            trip_id: row.trip_id,
            geometry: Point::new(row.longitude, row.latitude),
            accuracy: row.accuracy,
            time: row.time.with_timezone(&Utc),
            altitude: row.altitude,
            heading: row.heading,
            speed: row.speed,
            moving: row.moving,
            activity: row.activity,
            confidence: row.confidence,
        }
    }
}

#[derive(Debug, FromQueryResult)]
struct TracepointRow {
    trip_id: i32,
    point_id: Option<i32>,
    longitude: f64,
    latitude: f64,
}

impl From<TracepointRow> for RouteTracepoint {
    fn from(row: TracepointRow) -> Self {
        Self {
            geometry: Point::new(row.longitude, row.latitude),
            trip_id: row.trip_id,
            point_id: row.point_id,
        }
    }
}

impl From<trip::Model> for Trip {
    fn from(model: trip::Model) -> Self {
        Self {
            id: model.id,
            match_status: model.match_status.as_deref().map(TripStatus::from),
            fastest_status: model.fastest_status.as_deref().map(TripStatus::from),
            match_distance: model.match_distance,
            fastest_distance: model.fastest_distance,
        }
    }
}

fn geometry(ewkt: String) -> SimpleExpr {
    Expr::cust_with_values("ST_GeomFromEWKT(?)", [ewkt])
}

/// Mapped columns followed by the unmapped `geom` column
fn with_geometry<const N: usize>(columns: [DynIden; N]) -> Vec<DynIden> {
    let mut columns = columns.to_vec();
    columns.push(Alias::new("geom").into_iden());
    columns
}

impl PgTripStore {
    /// Use an existing connection pool
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Open a connection pool from a `postgres://` URL
    pub async fn connect(url: &str) -> Result<Self> {
        let db = Database::connect(url)
            .await
            .context("Failed to connect to the trip database")?;
        Ok(Self::new(db))
    }

    /// Tracepoint at one end of a trip, by tracepoint id
    async fn endpoint_tracepoint(
        &self,
        trip_id: TripId,
        order: Order,
    ) -> Result<Option<RouteTracepoint>> {
        let row = route_tracepoint::Entity::find()
            .column_as(Expr::cust("ST_X(geom)"), "longitude")
            .column_as(Expr::cust("ST_Y(geom)"), "latitude")
            .filter(route_tracepoint::Column::TripId.eq(trip_id))
            .order_by(route_tracepoint::Column::Id, order)
            .into_model::<TracepointRow>()
            .one(&self.db)
            .await
            .with_context(|| format!("Failed to load tracepoints of trip {}", trip_id))?;
        Ok(row.map(RouteTracepoint::from))
    }
}

impl TripStore for PgTripStore {
    async fn find_unmatched_trips(&self) -> Result<Vec<Trip>> {
        let trips = trip::Entity::find()
            .filter(trip::Column::MatchStatus.is_null())
            .order_by_asc(trip::Column::Id)
            .all(&self.db)
            .await?;
        Ok(trips.into_iter().map(Trip::from).collect())
    }

    async fn find_trips_without_fastest(&self) -> Result<Vec<Trip>> {
        let trips = trip::Entity::find()
            .filter(trip::Column::MatchStatus.eq(TripStatus::Ok.as_str()))
            .filter(trip::Column::FastestStatus.is_null())
            .order_by_asc(trip::Column::Id)
            .all(&self.db)
            .await?;
        Ok(trips.into_iter().map(Trip::from).collect())
    }

    async fn get_endpoint_tracepoints(&self, trip_id: TripId) -> Result<Vec<RouteTracepoint>> {
        let first = self.endpoint_tracepoint(trip_id, Order::Asc).await?;
        let last = self.endpoint_tracepoint(trip_id, Order::Desc).await?;
        Ok(first.into_iter().chain(last).collect())
    }

    async fn get_points(&self, trip_id: TripId) -> Result<Vec<TripPoint>> {
        let rows = point::Entity::find()
            .column_as(Expr::cust("ST_X(geom)"), "longitude")
            .column_as(Expr::cust("ST_Y(geom)"), "latitude")
            .filter(point::Column::TripId.eq(trip_id))
            .order_by_asc(point::Column::Time)
            .into_model::<PointRow>()
            .all(&self.db)
            .await
            .with_context(|| format!("Failed to load points of trip {}", trip_id))?;
        Ok(rows.into_iter().map(TripPoint::from).collect())
    }

    async fn insert_legs(&self, legs: &[RouteLeg]) -> Result<()> {
        if legs.is_empty() {
            return Ok(());
        }

        let mut insert = Query::insert();
        insert.into_table(route_leg::Entity).columns(with_geometry([
            route_leg::Column::Matching.into_iden(),
            route_leg::Column::Leg.into_iden(),
            route_leg::Column::Distance.into_iden(),
            route_leg::Column::Duration.into_iden(),
            route_leg::Column::Speed.into_iden(),
            route_leg::Column::SpeedOutlier.into_iden(),
            route_leg::Column::RouteType.into_iden(),
            route_leg::Column::Nodes.into_iden(),
            route_leg::Column::TripId.into_iden(),
            route_leg::Column::StartPointId.into_iden(),
            route_leg::Column::EndPointId.into_iden(),
            route_leg::Column::CreatedAt.into_iden(),
            route_leg::Column::UpdatedAt.into_iden(),
        ]));

        for leg in legs {
            insert.values([
                (leg.matching as i32).into(),
                (leg.leg as i32).into(),
                leg.distance.into(),
                leg.duration.into(),
                leg.speed.into(),
                leg.speed_outlier.into(),
                leg.route_type.as_str().into(),
                leg.nodes.clone().into(),
                leg.trip_id.into(),
                leg.start_point_id.into(),
                leg.end_point_id.into(),
                Expr::current_timestamp().into(),
                Expr::current_timestamp().into(),
                geometry(linestring_ewkt(&leg.geometry)),
            ])?;
        }

        let statement = self.db.get_database_backend().build(&insert);
        self.db
            .execute(statement)
            .await
            .context("Failed to insert route legs")?;
        debug!("Inserted {} route legs", legs.len());
        Ok(())
    }

    async fn insert_tracepoints(&self, tracepoints: &[RouteTracepoint]) -> Result<()> {
        if tracepoints.is_empty() {
            return Ok(());
        }

        let mut insert = Query::insert();
        insert.into_table(route_tracepoint::Entity).columns(with_geometry([
            route_tracepoint::Column::TripId.into_iden(),
            route_tracepoint::Column::PointId.into_iden(),
            route_tracepoint::Column::CreatedAt.into_iden(),
            route_tracepoint::Column::UpdatedAt.into_iden(),
        ]));

        for tracepoint in tracepoints {
            insert.values([
                tracepoint.trip_id.into(),
                tracepoint.point_id.into(),
                Expr::current_timestamp().into(),
                Expr::current_timestamp().into(),
                geometry(point_ewkt(&tracepoint.geometry)),
            ])?;
        }

        let statement = self.db.get_database_backend().build(&insert);
        self.db
            .execute(statement)
            .await
            .context("Failed to insert route tracepoints")?;
        debug!("Inserted {} route tracepoints", tracepoints.len());
        Ok(())
    }

    async fn save_trip(&self, trip: &Trip) -> Result<()> {
        let update = trip::ActiveModel {
            id: Set(trip.id),
            match_status: Set(trip.match_status.as_ref().map(|s| s.to_string())),
            fastest_status: Set(trip.fastest_status.as_ref().map(|s| s.to_string())),
            match_distance: Set(trip.match_distance),
            fastest_distance: Set(trip.fastest_distance),
            updated_at: Set(Utc::now().into()),
        };
        update
            .update(&self.db)
            .await
            .with_context(|| format!("Failed to save trip {}", trip.id))?;
        Ok(())
    }
}
