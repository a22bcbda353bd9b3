//! Tunables named directly by the spec. Kept as named constants rather than
//! scattered literals so the gossip, store and router crates agree on them.

use std::time::Duration;

/// An announcement this many hops from its origin (or more) is dropped on ingress.
pub const MAX_HOPS: u32 = 10;

/// How long a local capability announcement stays valid before it must be refreshed.
pub const CAP_TTL: Duration = Duration::from_secs(5 * 60);

/// How often a registered capability is re-announced into `_capabilities`.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// How often the gradient table sweeps `_capabilities` for expired entries.
pub const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// How often `NodeCostFactors` is recomputed and rewritten into `_cost`.
pub const COST_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Anti-entropy round interval.
pub const ANTI_ENTROPY_INTERVAL: Duration = Duration::from_secs(5);

/// Maximum serialized size of a single `Sync` frame.
pub const MAX_FRAME: usize = 64 * 1024;

/// Maximum serialized size of a single document's fields, rejected at insert.
pub const MAX_DOCUMENT_BYTES: usize = 1024 * 1024;

/// Grace period before tombstones become eligible for garbage collection.
pub const TOMB_GRACE: Duration = Duration::from_secs(7 * 24 * 3600);

/// Default expiry for an un-answered request/tool-request document.
pub const REQ_EXPIRY: Duration = Duration::from_secs(60);

/// Default timeout for `dispatch`, absent an explicit caller-supplied one.
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard timeout on a transport connect attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Size of the supervisor's seen-nonce LRU used for frame de-duplication.
pub const SEEN_NONCE_CAPACITY: usize = 512;

/// Per-collection observer queue bound; beyond this, oldest events are dropped.
pub const OBSERVER_QUEUE_CAPACITY: usize = 1024;

/// Ceiling used to normalize latency into a [0,1] score.
pub const LATENCY_CEILING_MS: f64 = 5000.0;

/// Per-transport default latency estimate used when a capability carries none.
pub const LAN_DEFAULT_LATENCY_MS: f64 = 30.0;
pub const RELAY_DEFAULT_LATENCY_MS: f64 = 200.0;
pub const BLE_DEFAULT_LATENCY_MS: f64 = 500.0;

/// Reconnect backoff bounds for flaky transports.
pub const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Idle duration after which a `PeerEntry` is considered gone.
pub const TTL_PEER: Duration = Duration::from_secs(90);

/// Domain separator mixed into the mesh handshake HMAC, see DESIGN.md.
pub const HANDSHAKE_DOMAIN: &[u8] = b"atmosphere-handshake-v1";

/// The mDNS service type peers advertise themselves under.
pub const MDNS_SERVICE_TYPE: &str = "_atmosphere._tcp.local.";
