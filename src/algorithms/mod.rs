//! Geodesy and navigation algorithms

pub mod geo;
pub mod navigation;

pub use geo::{bearing, cardinal_direction, distance, format_coordinates, CoordinateFormat};
pub use navigation::{NavigationCalculator, NavigationSnapshot};
