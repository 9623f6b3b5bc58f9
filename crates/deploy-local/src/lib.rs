mod shell_transport;

pub use shell_transport::ShellTransport;
