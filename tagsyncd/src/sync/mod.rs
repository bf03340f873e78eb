pub mod conflict;
pub mod echo;
pub mod engine;
pub mod local_watcher;
pub mod paths;
pub mod reconcile;
pub mod remote;
pub mod scope;
pub mod state;
pub mod tags;
pub mod vault;

#[cfg(test)]
pub(crate) mod test_support;
