mod assert;
pub mod directories;
mod namespace;

pub use namespace::{
    MAX_SERVICE_NAME, NameError, segment_name, socket_path, validate_service_name,
};
