pub mod cim;
pub mod connector;
pub mod coordinator;
pub mod output;
pub mod poller;
pub mod sink;
pub mod stop;

#[doc(hidden)]
pub mod testing;
