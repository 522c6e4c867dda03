pub mod bert;
pub mod model;
