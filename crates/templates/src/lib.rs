//! Template management — versioned, vertical-bindable packaging of journey
//! definitions, instantiable into concrete instances.

pub mod manager;
pub mod models;

pub use manager::TemplateManager;
pub use models::{
    BindingType, CloneRecord, DefinitionPayload, Instantiation, TemplateSpec, TemplateVersion,
    VerticalBinding,
};
