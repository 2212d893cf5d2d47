/// Process-wide feed policy.
///
/// Built once from the command line and passed into gateway construction.
/// All fields are read-only after startup.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Stamp persisted rows with the local wall clock instead of the
    /// venue-reported time.
    pub is_local_timestamp: bool,

    /// Optional HTTP/WebSocket proxy URL for venues behind a firewall.
    pub proxy: Option<String>,

    /// Order-book depth held per instrument.
    pub depth: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            is_local_timestamp: true,
            proxy: None,
            depth: 20,
        }
    }
}
