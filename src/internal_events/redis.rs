use super::InternalEvent;
use metrics::counter;

#[derive(Debug)]
pub struct RedisConnected<'a> {
    pub url: &'a str,
}

impl InternalEvent for RedisConnected<'_> {
    fn emit_logs(&self) {
        info!(message = "Connected to Redis.", url = %self.url);
    }

    fn emit_metrics(&self) {
        counter!("redis_connections_established_total", 1);
    }
}
