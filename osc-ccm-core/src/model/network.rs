use super::{Filterable, Tags};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subnet {
    pub id: String,
    pub vpc_id: String,
    pub availability_zone: String,
    pub tags: Tags,
}

impl Filterable for Subnet {
    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn attribute_values(&self, name: &str) -> Vec<String> {
        match name {
            "subnet-id" => vec![self.id.to_owned()],
            "vpc-id" => vec![self.vpc_id.to_owned()],
            "availability-zone" => vec![self.availability_zone.to_owned()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Vpc {
    pub id: String,
    pub cidr_blocks: Vec<String>,
    pub tags: Tags,
}

impl Filterable for Vpc {
    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn attribute_values(&self, name: &str) -> Vec<String> {
        match name {
            "vpc-id" => vec![self.id.to_owned()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteState {
    #[default]
    Active,
    Blackhole,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Route {
    pub destination_cidr: String,
    pub instance_id: Option<String>,
    pub gateway_id: Option<String>,
    pub state: RouteState,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteTableAssociation {
    pub subnet_id: Option<String>,
    pub main: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteTable {
    pub id: String,
    pub vpc_id: String,
    pub routes: Vec<Route>,
    pub associations: Vec<RouteTableAssociation>,
    pub tags: Tags,
}

impl Filterable for RouteTable {
    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn attribute_values(&self, name: &str) -> Vec<String> {
        match name {
            "route-table-id" => vec![self.id.to_owned()],
            "vpc-id" => vec![self.vpc_id.to_owned()],
            _ => Vec::new(),
        }
    }
}
