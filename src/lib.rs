//! farmscape generates complete farming-simulator map packages from a pair
//! of real world coordinates: a 16-bit heightmap, ground texture weight
//! masks, GRLE info layers, background terrain and water meshes, a road
//! surface mesh and the XML descriptors the game editor expects.
//!
//! The pipeline is a fixed sequence of components over a shared
//! [`map::MapContext`]; [`map::Map::generate`] yields one component name at
//! a time so hosts can render progress. External data (elevation tiles, map
//! features, imagery) enters through the [`dtm`], [`osm`] and [`imagery`]
//! provider traits.

pub mod component;
pub mod dtm;
pub mod error;
pub mod game;
pub mod geometry;
pub mod imagery;
pub mod infolayer;
pub mod map;
pub mod mesh;
pub mod osm;
pub mod raster;
pub mod schema;
pub mod settings;
pub mod xmlutil;

pub use error::{FetchError, GenerationError};
pub use game::{GameKind, GameProfile};
pub use map::{Map, MapContext};
