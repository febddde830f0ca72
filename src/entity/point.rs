use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "point")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub trip_id: i32,
    #[sea_orm(column_type = "Double")]
    pub accuracy: f64,
    #[sea_orm(column_type = "Double", nullable)]
    pub altitude: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub heading: Option<f64>,
    pub moving: Option<bool>,
    #[sea_orm(column_type = "Double", nullable)]
    pub speed: Option<f64>,
    pub time: DateTimeWithTimeZone,
    pub activity: Option<i32>,
    pub confidence: Option<i32>,
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
