mod dispatcher;
mod eviction;
mod object_descriptor;
mod object_registry;
mod populator;
mod util;
mod vlm_config;
mod vlm_core;
mod vlm_error;
mod vlm_source;

#[cfg(test)]
mod test;

pub use crate::vlm_config::VLMConfig;
pub use crate::vlm_core::{
    arena_free_bytes, check_object, destroy_object, init_with_config, mark_dirty, new_object,
    new_object_multidim, object_dims, object_error, object_len, resident_bytes, set_debug,
    shutdown,
};
pub use crate::vlm_error::VLMError;
pub use crate::vlm_source::{ElementKind, PopulateCallout, PopulateError, PopulateSource, VLMSource};
pub mod modules;
