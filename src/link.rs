use crate::storage::{ConnectionState, Storage, StorageResult, TxRecord};
use crate::types::{EdgeState, LinkEvent, LinkRef, LinkState, LinkUpdate};
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::Arc;

/// State machine for one directed connection (src, dst).
///
/// Tracks the sender's tx sequence and the receiver's rx sequence, keeps a
/// FIFO queue of unacknowledged send observations and classifies the link
/// from routing presence and pending-message age. All persistent state lives
/// in one connections row plus the tx_history rows; writes are coalesced
/// behind a dirty flag and flushed once per update.
pub struct Link {
    storage: Arc<Storage>,
    src: String,
    dst: String,
    src_name: String,
    dst_name: String,
    /// BAD threshold: src tx_limit + dst rx_limit
    time_limit: Duration,
    conn_id: i64,
    record: ConnectionState,
    dirty: bool,
    tx_state: Option<EdgeState>,
    rx_state: Option<EdgeState>,
    tx_history: VecDeque<TxRecord>,
}

impl Link {
    /// Load the connection from storage, creating its row on first sight,
    /// then recompute the overall state from what was restored.
    pub fn new(
        storage: Arc<Storage>,
        src: &str,
        dst: &str,
        time_limit: Duration,
        src_name: &str,
        dst_name: &str,
    ) -> StorageResult<Self> {
        let mut record = storage.get_connection_state(src, dst)?.unwrap_or_default();
        if record.id.is_none() {
            storage.set_connection_state(src, dst, &mut record)?;
        }
        let conn_id = record
            .id
            .ok_or_else(|| crate::storage::StorageError::InvalidData(format!("no id for {}->{}", src, dst)))?;
        let tx_state = edge_from_record(record.tx_state.as_deref(), record.tx_seq, record.tx_height);
        let rx_state = edge_from_record(record.rx_state.as_deref(), record.rx_seq, record.rx_height);
        let tx_history: VecDeque<TxRecord> = storage.get_tx_records(conn_id)?.into();

        let mut link = Self {
            storage,
            src: src.to_string(),
            dst: dst.to_string(),
            src_name: src_name.to_string(),
            dst_name: dst_name.to_string(),
            time_limit,
            conn_id,
            record,
            dirty: false,
            tx_state,
            rx_state,
            tx_history,
        };
        // restored counters may already classify differently than the stored
        // state; events from this recomputation are not replayed
        link.handle_update(&LinkUpdate::default(), Utc::now())?;
        Ok(link)
    }

    pub fn src(&self) -> &str {
        &self.src
    }

    pub fn dst(&self) -> &str {
        &self.dst
    }

    pub fn src_name(&self) -> &str {
        &self.src_name
    }

    pub fn dst_name(&self) -> &str {
        &self.dst_name
    }

    pub fn state(&self) -> LinkState {
        self.record.state.unwrap_or(LinkState::Unknown)
    }

    pub fn tx_seq(&self) -> Option<u64> {
        self.record.tx_seq
    }

    pub fn rx_seq(&self) -> Option<u64> {
        self.record.rx_seq
    }

    pub fn tx_height(&self) -> Option<u64> {
        self.record.tx_height
    }

    pub fn rx_height(&self) -> Option<u64> {
        self.record.rx_height
    }

    /// Messages sent but not yet acknowledged
    pub fn pending_count(&self) -> u64 {
        match (self.record.tx_seq, self.record.rx_seq) {
            (Some(tx), Some(rx)) => tx.saturating_sub(rx),
            _ => 0,
        }
    }

    /// Age of the oldest unacknowledged message, zero when none are pending
    pub fn pending_duration(&self) -> Duration {
        match self.tx_history.front() {
            Some(record) => Utc::now() - record.ts,
            None => Duration::zero(),
        }
    }

    pub fn link_ref(&self) -> LinkRef {
        LinkRef {
            src: self.src.clone(),
            dst: self.dst.clone(),
            src_name: self.src_name.clone(),
            dst_name: self.dst_name.clone(),
        }
    }

    /// Apply one round's observation. Missing sides fall back to the last
    /// known edge state; the link is UNKNOWN until both sides have been seen.
    /// Returns whether the overall state changed, plus the events emitted.
    pub fn handle_update(
        &mut self,
        update: &LinkUpdate,
        now: DateTime<Utc>,
    ) -> StorageResult<(bool, Vec<LinkEvent>)> {
        let tx = update.tx.or(self.tx_state);
        let rx = update.rx.or(self.rx_state);
        let mut events = Vec::new();

        let state = match (tx, rx) {
            (Some(tx), Some(rx)) => {
                self.handle_tx(tx, now, &mut events)?;
                self.handle_rx(rx, now, &mut events)?;
                if !tx.is_active() || !rx.is_active() {
                    LinkState::Broken
                } else if self
                    .tx_history
                    .front()
                    .is_some_and(|record| now - record.ts > self.time_limit)
                {
                    LinkState::Bad
                } else {
                    LinkState::Good
                }
            }
            _ => LinkState::Unknown,
        };

        let mut changed = false;
        if self.state() != state {
            changed = true;
            events.push(LinkEvent::State {
                link: self.link_ref(),
                before: self.state(),
                after: state,
            });
            self.set_state(state);
        }
        self.set_tx_edge(tx);
        self.set_rx_edge(rx);
        self.flush()?;
        Ok((changed, events))
    }

    fn handle_tx(&mut self, tx: EdgeState, now: DateTime<Utc>, events: &mut Vec<LinkEvent>) -> StorageResult<()> {
        match tx {
            EdgeState::Active { seq, height } => {
                match self.record.tx_seq {
                    None => {
                        self.set_tx_seq(Some(seq));
                        self.set_tx_ts(Some(now));
                    }
                    Some(prev) if prev < seq => {
                        self.set_tx_seq(Some(seq));
                        self.set_tx_ts(Some(now));
                        self.push_tx_record(seq, now)?;
                        events.push(LinkEvent::Tx {
                            link: self.link_ref(),
                            seq: prev,
                            count: seq - prev,
                        });
                    }
                    Some(_) => {}
                }
                if self.record.tx_height.is_none_or(|h| height > h) {
                    self.set_tx_height(Some(height));
                }
            }
            EdgeState::Inactive => {
                if self.record.tx_seq.is_some() {
                    self.set_tx_seq(None);
                    self.set_tx_ts(Some(now));
                    self.set_tx_height(None);
                }
            }
        }
        Ok(())
    }

    fn handle_rx(&mut self, rx: EdgeState, now: DateTime<Utc>, events: &mut Vec<LinkEvent>) -> StorageResult<()> {
        match rx {
            EdgeState::Active { seq: new_seq, height } => {
                if self.record.rx_seq.is_none() {
                    self.set_rx_seq(Some(new_seq));
                    self.set_rx_ts(Some(now));
                } else {
                    // drain acknowledged records oldest-first; one event per
                    // step so each carries the delay of the record covering it
                    loop {
                        let prev = match self.record.rx_seq {
                            Some(cur) if cur < new_seq => cur,
                            _ => break,
                        };
                        let Some(head) = self.tx_history.front().cloned() else {
                            break;
                        };
                        let advanced_to = if head.tx_seq <= new_seq {
                            self.pop_tx_record()?;
                            head.tx_seq
                        } else {
                            new_seq
                        };
                        self.set_rx_seq(Some(advanced_to));
                        self.set_rx_ts(Some(now));
                        events.push(LinkEvent::Rx {
                            link: self.link_ref(),
                            seq: prev,
                            count: advanced_to - prev,
                            delay: now - head.ts,
                        });
                    }
                    // ack beyond every record ever queued (history lost):
                    // catch up with a single zero-delay event
                    if let Some(prev) = self.record.rx_seq {
                        if prev < new_seq {
                            self.set_rx_seq(Some(new_seq));
                            self.set_rx_ts(Some(now));
                            events.push(LinkEvent::Rx {
                                link: self.link_ref(),
                                seq: prev,
                                count: new_seq - prev,
                                delay: Duration::zero(),
                            });
                        }
                    }
                }
                if self.record.rx_height.is_none_or(|h| height > h) {
                    self.set_rx_height(Some(height));
                }
            }
            EdgeState::Inactive => {
                if self.record.rx_seq.is_some() {
                    self.set_rx_seq(None);
                    self.set_rx_ts(Some(now));
                    self.set_rx_height(None);
                }
            }
        }
        Ok(())
    }

    /// Persist the row if anything changed since the last flush
    pub fn flush(&mut self) -> StorageResult<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.storage.set_connection_state(&self.src, &self.dst, &mut self.record)?;
        self.dirty = false;
        Ok(true)
    }

    fn push_tx_record(&mut self, tx_seq: u64, ts: DateTime<Utc>) -> StorageResult<()> {
        let record = self.storage.add_tx_record(self.conn_id, tx_seq, ts)?;
        self.tx_history.push_back(record);
        Ok(())
    }

    fn pop_tx_record(&mut self) -> StorageResult<()> {
        if let Some(record) = self.tx_history.pop_front() {
            self.storage.delete_tx_record(record.sn)?;
        }
        Ok(())
    }

    fn set_state(&mut self, state: LinkState) {
        if self.record.state != Some(state) {
            self.record.state = Some(state);
            self.dirty = true;
        }
    }

    fn set_tx_edge(&mut self, edge: Option<EdgeState>) {
        if self.tx_state != edge {
            self.tx_state = edge;
            self.record.tx_state = edge.map(|e| e.tag().to_string());
            self.dirty = true;
        }
    }

    fn set_rx_edge(&mut self, edge: Option<EdgeState>) {
        if self.rx_state != edge {
            self.rx_state = edge;
            self.record.rx_state = edge.map(|e| e.tag().to_string());
            self.dirty = true;
        }
    }

    fn set_tx_seq(&mut self, seq: Option<u64>) {
        if self.record.tx_seq != seq {
            self.record.tx_seq = seq;
            self.dirty = true;
        }
    }

    fn set_tx_ts(&mut self, ts: Option<DateTime<Utc>>) {
        if self.record.tx_ts != ts {
            self.record.tx_ts = ts;
            self.dirty = true;
        }
    }

    fn set_tx_height(&mut self, height: Option<u64>) {
        if self.record.tx_height != height {
            self.record.tx_height = height;
            self.dirty = true;
        }
    }

    fn set_rx_seq(&mut self, seq: Option<u64>) {
        if self.record.rx_seq != seq {
            self.record.rx_seq = seq;
            self.dirty = true;
        }
    }

    fn set_rx_ts(&mut self, ts: Option<DateTime<Utc>>) {
        if self.record.rx_ts != ts {
            self.record.rx_ts = ts;
            self.dirty = true;
        }
    }

    fn set_rx_height(&mut self, height: Option<u64>) {
        if self.record.rx_height != height {
            self.record.rx_height = height;
            self.dirty = true;
        }
    }
}

fn edge_from_record(tag: Option<&str>, seq: Option<u64>, height: Option<u64>) -> Option<EdgeState> {
    match tag {
        Some("active") => Some(EdgeState::Active { seq: seq.unwrap_or(0), height: height.unwrap_or(0) }),
        Some("inactive") => Some(EdgeState::Inactive),
        _ => None,
    }
}
