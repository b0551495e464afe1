pub mod interface;

pub use interface::LinuxInterfaceReader;
