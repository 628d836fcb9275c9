/// How unicast listeners are bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListenMode {
    /// One wildcard socket shared by every interface.
    #[default]
    Global,
    /// One socket per local IPv4 address.
    PerInterface,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen_mode: ListenMode,
    /// Port for the global listener. `0` picks a random free port.
    pub global_port: u16,
    /// Joins the protocol's multicast group when it declares one.
    ///
    /// Does not stop unicast replies from being received.
    pub multicast: bool,
    /// Hosts probed per subnet during an active scan.
    pub host_cap: usize,
    pub recv_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_mode: ListenMode::Global,
            global_port: 0,
            multicast: true,
            host_cap: 254,
            recv_buffer_size: 9000,
        }
    }
}
