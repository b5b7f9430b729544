#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;

pub mod acme;
pub mod ca;
pub mod config;
pub mod profile;
pub mod store;
pub mod types;
pub mod util;
pub mod validator;
