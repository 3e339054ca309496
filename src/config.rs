#[derive(Clone)]
pub struct CanopyConfig {
    /// How many send intervals each peer's loop runs per second.
    pub intervals_per_second: u32,
    /// Fixed tick interval in microseconds. Normally `1_000_000 / intervals_per_second`.
    pub send_interval_usecs: u64,
    /// Server-wide ceiling on packets sent to any one client in a single interval,
    /// regardless of what the client asked for.
    pub max_packets_per_client_per_interval: usize,
    /// Fallback packets-per-second quota used when a peer's query doesn't carry one.
    pub default_max_query_pps: u32,
    /// Maximum size of one wire packet, headers included.
    pub max_packet_size: usize,
    /// If the live packet has fewer bytes than this available, stop trying to pack
    /// more sections into it and flush.
    pub min_bytes_for_more_packing: usize,
    /// How many consecutive didn't-fit encode attempts we tolerate against one wire
    /// packet before forcing a flush.
    pub max_packing_attempts: usize,
    /// Bytes reserved per section for compression bookkeeping when shrinking the
    /// scratch target to the remaining room in the live packet.
    pub compress_padding: usize,
    /// How many previously sent packets are retained for NACK-driven retransmission.
    pub sent_packets_buffer_size: usize,
    /// Missing sequence numbers further than this behind the newest received one are
    /// pruned before a NACK is constructed.
    pub nack_prune_window: u16,
}

impl Default for CanopyConfig {
    fn default() -> Self {
        let intervals_per_second = 60;
        Self {
            intervals_per_second,
            send_interval_usecs: 1_000_000 / intervals_per_second as u64,
            max_packets_per_client_per_interval: 16,
            default_max_query_pps: 600,
            max_packet_size: 1400,
            min_bytes_for_more_packing: 40,
            max_packing_attempts: 5,
            compress_padding: 8,
            sent_packets_buffer_size: 256,
            nack_prune_window: 512,
        }
    }
}
