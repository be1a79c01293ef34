//! Dedicated single-connection entities.
//!
//! An upgraded connection gets its own entity and its own rate handler.
//! Each `do_processing` is exactly one transport call bounded by the
//! handler's allowance and the controller's cap.

use std::sync::Arc;

use sluice_core::{EventWaiter, SharedConnection};

use crate::entity::{Priority, RateControlledEntity};
use crate::rate_handler::SharedRateHandler;

fn cap(allowed: usize, max_bytes: Option<usize>) -> usize {
    match max_bytes {
        Some(max) => allowed.min(max),
        None => allowed,
    }
}

pub struct SinglePeerUploader {
    conn: SharedConnection,
    handler: SharedRateHandler,
}

impl SinglePeerUploader {
    pub fn new(conn: SharedConnection, handler: SharedRateHandler) -> Self {
        Self { conn, handler }
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }
}

impl RateControlledEntity for SinglePeerUploader {
    fn can_process(&self, waiter: &Arc<EventWaiter>) -> bool {
        if !self.conn.is_ready_for_write(waiter) {
            return false;
        }
        if self.conn.outgoing_total_size() == 0 {
            return false;
        }
        self.handler.current_allowance().permits_transfer()
    }

    fn do_processing(&self, waiter: &Arc<EventWaiter>, max_bytes: Option<usize>) -> usize {
        if !self.conn.is_ready_for_write(waiter) {
            return 0;
        }
        let allowance = self.handler.current_allowance();
        let allowed = cap(allowance.bytes, max_bytes);
        if allowed == 0 {
            return 0;
        }
        let queued = self.conn.outgoing_total_size();
        if queued == 0 {
            return 0;
        }

        match self
            .conn
            .deliver_to_transport(allowed.min(queued), allowance.protocol_is_free, false)
        {
            Ok(moved) => {
                let written = moved.total();
                if written > 0 {
                    self.handler
                        .bytes_processed(moved.data_bytes, moved.protocol_bytes);
                }
                written
            }
            Err(error) => {
                tracing::debug!(conn = self.conn.id(), %error, "dedicated write failed");
                self.conn.notify_of_exception(error);
                0
            }
        }
    }

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    fn priority_boost(&self) -> bool {
        self.conn.priority_boost()
    }

    fn rate_handler(&self) -> SharedRateHandler {
        self.handler.clone()
    }

    fn bytes_ready_to_write(&self) -> usize {
        self.conn.outgoing_total_size()
    }

    fn connection_count(&self) -> usize {
        1
    }

    fn ready_connection_count(&self, waiter: &Arc<EventWaiter>) -> usize {
        usize::from(self.conn.is_ready_for_write(waiter))
    }

    fn describe(&self) -> String {
        format!("dedicated upload: {}", self.conn.describe())
    }
}

pub struct SinglePeerDownloader {
    conn: SharedConnection,
    handler: SharedRateHandler,
}

impl SinglePeerDownloader {
    pub fn new(conn: SharedConnection, handler: SharedRateHandler) -> Self {
        Self { conn, handler }
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }
}

impl RateControlledEntity for SinglePeerDownloader {
    fn can_process(&self, waiter: &Arc<EventWaiter>) -> bool {
        if !self.conn.is_ready_for_read(waiter).is_ready() {
            return false;
        }
        self.handler.current_allowance().bytes > 0
    }

    fn do_processing(&self, waiter: &Arc<EventWaiter>, max_bytes: Option<usize>) -> usize {
        if !self.conn.is_ready_for_read(waiter).is_ready() {
            return 0;
        }
        let allowance = self.handler.current_allowance();
        let allowed = cap(allowance.bytes, max_bytes);
        if allowed == 0 {
            return 0;
        }

        match self
            .conn
            .receive_from_transport(allowed, allowance.protocol_is_free)
        {
            Ok(moved) => {
                let read = moved.total();
                if read > 0 {
                    self.handler
                        .bytes_processed(moved.data_bytes, moved.protocol_bytes);
                }
                read
            }
            Err(error) => {
                tracing::debug!(conn = self.conn.id(), %error, "dedicated read failed");
                self.conn.notify_of_exception(error);
                0
            }
        }
    }

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    fn rate_handler(&self) -> SharedRateHandler {
        self.handler.clone()
    }

    fn connection_count(&self) -> usize {
        1
    }

    fn ready_connection_count(&self, waiter: &Arc<EventWaiter>) -> usize {
        usize::from(self.conn.is_ready_for_read(waiter).is_ready())
    }

    fn describe(&self) -> String {
        format!("dedicated download: {}", self.conn.describe())
    }
}
