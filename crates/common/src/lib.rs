// consulta-common: shared types for the Consulta consultation platform

pub mod protocol;
pub mod types;
