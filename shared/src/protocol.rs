/// Default mDNS service type advertised by MPS portal services
pub const MPS_PORTAL_SERVICE_TYPE: &str = "_mps-portal._tcp.local.";

/// Wire keys of the last-event-time table, one per event kind
pub const CHANNEL_EVENT: &str = "channel-event";
pub const INPUT_CHANNEL_EVENT: &str = "input-channel-event";
pub const MPS_EVENT: &str = "mps-event";

/// RPC method names understood by a portal
pub const METHOD_HOST_NAME: &str = "getHostName";
pub const METHOD_LAUNCH_TIME: &str = "getLaunchTime";
pub const METHOD_PROCESS_ID: &str = "getProcessID";
pub const METHOD_LOGS_STATISTICS: &str = "logsStatistics";
pub const METHOD_CATEGORIES: &str = "getMPSTypes";
pub const METHOD_LAST_EVENT_TIMES: &str = "getLastEventTimes";
pub const METHOD_FIRST_HIT_TEXT: &str = "getFirstHitText";
pub const METHOD_TRIP_SUMMARY: &str = "getMPSTripSummary";
pub const METHOD_LATEST_EVENTS: &str = "getLatestMPSEvents";
pub const METHOD_CHANNEL_INFO: &str = "getMPSChannelInfo";
pub const METHOD_INPUT_CHANNEL_INFO: &str = "getInputChannelInfo";
pub const METHOD_RELOAD_SIGNALS: &str = "reloadSignals";
pub const METHOD_SHUTDOWN: &str = "shutdown";
