pub mod branch;
pub mod codec;
pub mod merkle;
pub mod orphans;
pub mod params;
pub mod processor;
pub mod script;
pub mod types;
pub mod validation;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;
