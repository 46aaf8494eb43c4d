pub mod active;
pub mod apm;
pub mod cep;
pub mod cep_arena;
pub mod cm_config;
pub mod cm_error;
pub mod cm_stats;
pub mod conn_info;
pub mod connection_manager;
pub mod context;
pub mod disconnect;
pub mod dispatcher;
pub mod formats;
pub mod identity_maps;
pub mod lifecycle;
pub mod notification;
pub mod params;
pub mod passive;
pub mod port_resolver;
pub mod sidr;
pub mod timer;
