use super::InternalEvent;
use crate::store::StoreError;
use metrics::{counter, histogram};
use std::time::Duration;

#[derive(Debug)]
pub struct SlotAcquired<'a> {
    pub key: &'a str,
    pub id: &'a str,
    pub count: usize,
    pub limit: usize,
    pub waited: Duration,
}

impl InternalEvent for SlotAcquired<'_> {
    fn emit_logs(&self) {
        debug!(
            message = "Acquired execution slot.",
            key = %self.key,
            id = %self.id,
            count = %self.count,
            limit = %self.limit,
            waited = ?self.waited,
        );
    }

    fn emit_metrics(&self) {
        counter!("slots_acquired_total", 1, "key" => self.key.to_owned());
        histogram!("slot_wait_seconds", self.waited.as_secs_f64(), "key" => self.key.to_owned());
    }
}

#[derive(Debug)]
pub struct SlotRejected<'a> {
    pub key: &'a str,
    pub count: usize,
    pub limit: usize,
}

impl InternalEvent for SlotRejected<'_> {
    fn emit_logs(&self) {
        trace!(
            message = "No execution slot available, retrying.",
            key = %self.key,
            count = %self.count,
            limit = %self.limit,
        );
    }

    fn emit_metrics(&self) {
        counter!("slot_rejections_total", 1, "key" => self.key.to_owned());
    }
}

#[derive(Debug)]
pub struct SlotWaitTimedOut<'a> {
    pub key: &'a str,
    pub limit: usize,
    pub timeout: Duration,
}

impl InternalEvent for SlotWaitTimedOut<'_> {
    fn emit_logs(&self) {
        warn!(
            message = "Gave up waiting for an execution slot.",
            key = %self.key,
            limit = %self.limit,
            timeout = ?self.timeout,
        );
    }

    fn emit_metrics(&self) {
        counter!("limit_exceeded_total", 1, "key" => self.key.to_owned());
    }
}

#[derive(Debug)]
pub struct SlotReleased<'a> {
    pub key: &'a str,
    pub id: &'a str,
    pub held: Duration,
}

impl InternalEvent for SlotReleased<'_> {
    fn emit_logs(&self) {
        debug!(
            message = "Released execution slot.",
            key = %self.key,
            id = %self.id,
            held = ?self.held,
        );
    }

    fn emit_metrics(&self) {
        counter!("slots_released_total", 1, "key" => self.key.to_owned());
        histogram!("slot_held_seconds", self.held.as_secs_f64(), "key" => self.key.to_owned());
    }
}

#[derive(Debug)]
pub struct SlotReleaseFailed<'a> {
    pub key: &'a str,
    pub id: &'a str,
    pub error: &'a StoreError,
}

impl InternalEvent for SlotReleaseFailed<'_> {
    fn emit_logs(&self) {
        error!(
            message = "Failed to release execution slot; it stays taken until cleaned or expired.",
            key = %self.key,
            id = %self.id,
            error = %self.error,
        );
    }

    fn emit_metrics(&self) {
        counter!("slot_release_errors_total", 1, "key" => self.key.to_owned());
    }
}

#[derive(Debug)]
pub struct StaleSlotsCleaned<'a> {
    pub key: &'a str,
    pub count: usize,
}

impl InternalEvent for StaleSlotsCleaned<'_> {
    fn emit_logs(&self) {
        if self.count > 0 {
            info!(
                message = "Removed stale execution slots.",
                key = %self.key,
                count = %self.count,
            );
        } else {
            debug!(message = "No stale execution slots found.", key = %self.key);
        }
    }

    fn emit_metrics(&self) {
        counter!(
            "stale_slots_cleaned_total",
            self.count as u64,
            "key" => self.key.to_owned()
        );
    }
}
