//! MPU-side service state: the datastore map, the mailbox FIFOs, the
//! sandboxed file store, the process table and the console relay. The engine
//! routes both wire commands and authorised MQTT requests into these.

pub mod console;
pub mod datastore;
pub mod files;
pub mod mailbox;
pub mod process;
