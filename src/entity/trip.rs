use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "trip")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub match_status: Option<String>,
    pub fastest_status: Option<String>,
    #[sea_orm(column_type = "Double", nullable)]
    pub match_distance: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub fastest_distance: Option<f64>,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::point::Entity")]
    Point,
    #[sea_orm(has_many = "super::route_leg::Entity")]
    RouteLeg,
    #[sea_orm(has_many = "super::route_tracepoint::Entity")]
    RouteTracepoint,
}

impl Related<super::point::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Point.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
