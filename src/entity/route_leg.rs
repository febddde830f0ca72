use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "route_leg")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub matching: i32,
    pub leg: i32,
    #[sea_orm(column_type = "Double")]
    pub distance: f64,
    #[sea_orm(column_type = "Double")]
    pub duration: f64,
    #[sea_orm(column_type = "Double")]
    pub speed: f64,
    pub speed_outlier: bool,
    pub route_type: String,
    pub nodes: Vec<i64>,
    pub trip_id: i32,
    pub start_point_id: Option<i32>,
    pub end_point_id: Option<i32>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::trip::Entity",
        from = "Column::TripId",
        to = "super::trip::Column::Id"
    )]
    Trip,
}

impl Related<super::trip::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Trip.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
