pub mod background;
pub mod config;
pub mod dem;
pub mod grle;
pub mod i3d;
pub mod road;
pub mod satellite;
pub mod texture;
