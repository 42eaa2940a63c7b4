//! Per-client control connection state machine.
//!
//! A connection moves through three states: active (normal read/write),
//! draining-for-close (`bad_conn_close` set: input is ignored and queued
//! output flushes out), and closed (the object is dropped). The reactor
//! drives it with readable/writable notifications and destroys it when an
//! entry point returns `true`.
//!
//! The error taxonomy maps onto plain control flow: protocol and
//! not-found errors queue a single error packet and the connection keeps
//! going; allocation failure (`TryReserveError` bubbling out of any packet
//! or handle-table step) switches to the two-phase out-of-memory close; a
//! failure that cannot even be reported makes the entry point return
//! `true` so the reactor destroys the connection without further I/O.

use std::cell::RefCell;
use std::collections::{TryReserveError, VecDeque};
use std::io::{self, Read, Write};
use std::rc::Rc;

use crate::control::buffer::RecvBuffer;
use crate::control::codec::{self, InfoTag, ReqTag, HANDLE_REQ_LEN, NAME_REQ_HEADER};
use crate::control::handle::{Handle, HandleAllocator};
use crate::reactor::{Interest, WatchControl};
use crate::supervisor::{
    ConnId, ServiceBroker, ServiceEvent, ServiceId, ServiceListener, SupervisorContext,
};
use crate::trace::{debug, error, warn};

/// One client connection over a byte stream.
///
/// `S` is the socket (nonblocking `Read + Write`); `W` is the reactor watch
/// handle for adjusting readiness interest.
pub struct ControlConn<S, W> {
    id: ConnId,
    stream: S,
    watch: W,
    ctx: Rc<RefCell<SupervisorContext>>,
    rbuf: RecvBuffer,
    /// Bytes that must be buffered before the next parse attempt; raised to
    /// the known packet size as headers arrive, reset to 1 after a packet.
    chklen: usize,
    handles: HandleAllocator,
    /// Outgoing packets; bytes before `out_index` in the head packet are
    /// already transmitted.
    outbuf: VecDeque<Vec<u8>>,
    out_index: usize,
    /// Close once output drains; no further input is processed.
    bad_conn_close: bool,
    /// Send the out-of-memory indicator before closing.
    oom_close: bool,
    #[cfg(test)]
    force_oom: bool,
}

impl<S: Read + Write, W: WatchControl> ControlConn<S, W> {
    /// Wraps an accepted socket. The caller has already registered `stream`
    /// with the reactor for read readiness and obtained `watch` for it.
    pub fn new(stream: S, watch: W, ctx: Rc<RefCell<SupervisorContext>>) -> Self {
        let id = ctx.borrow_mut().register_conn();
        debug!("control connection {:?} opened", id);
        Self {
            id,
            stream,
            watch,
            ctx,
            rbuf: RecvBuffer::new(),
            chklen: 1,
            handles: HandleAllocator::new(),
            outbuf: VecDeque::new(),
            out_index: 0,
            bad_conn_close: false,
            oom_close: false,
            #[cfg(test)]
            force_oom: false,
        }
    }

    /// This connection's identity in the supervisor context.
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Combined reactor entry point. Returns true if the connection should
    /// be destroyed.
    pub fn io_ready<B: ServiceBroker>(
        &mut self,
        broker: &mut B,
        readable: bool,
        writable: bool,
    ) -> bool {
        if readable && self.data_ready(broker) {
            return true;
        }
        if writable && self.send_data() {
            return true;
        }
        false
    }

    /// Readable notification: buffer what the socket has and process every
    /// complete packet. Returns true if the connection should be destroyed.
    pub fn data_ready<B: ServiceBroker>(&mut self, broker: &mut B) -> bool {
        if self.bad_conn_close {
            // draining for close; input is ignored
            return false;
        }
        if self.rbuf.free_space() > 0 {
            match self.rbuf.fill(&mut self.stream) {
                Ok(0) => {
                    debug!("control connection {:?}: peer closed", self.id);
                    return true;
                }
                Ok(_) => {}
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!("control connection {:?}: read failed: {err}", self.id);
                    return true;
                }
            }
        }
        while !self.bad_conn_close && self.rbuf.len() >= self.chklen {
            if self.process_packet(broker).is_err() {
                self.do_oom_close();
                break;
            }
        }
        false
    }

    /// Writable notification: flush the outgoing queue as far as the socket
    /// allows. Returns true if the connection should be destroyed.
    pub fn send_data(&mut self) -> bool {
        while let Some(head) = self.outbuf.front() {
            let remaining = &head[self.out_index..];
            match self.stream.write(remaining) {
                Ok(0) => return true,
                Ok(n) if n == remaining.len() => {
                    self.outbuf.pop_front();
                    self.out_index = 0;
                }
                Ok(n) => {
                    // partial write: remember the offset and wait for the
                    // next writable notification
                    self.out_index += n;
                    return false;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return false,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    error!("control connection {:?}: write failed: {err}", self.id);
                    return true;
                }
            }
        }
        if self.oom_close {
            // best effort: the indicator is preencoded and needs no
            // allocation; close whether or not it goes out
            let _ = self.stream.write(&codec::OOM_PACKET);
            return true;
        }
        if self.bad_conn_close {
            return true;
        }
        // drained: stop polling for writability until something is queued
        self.watch.set_watches(Interest::READ);
        false
    }

    /// Notifies the peer that rollback completed, if this connection is the
    /// registered listener. Returns true if the connection should be
    /// destroyed.
    pub fn rollback_complete(&mut self) -> bool {
        let is_listener = self.ctx.borrow().rollback_listener() == Some(self.id);
        if !is_listener {
            return false;
        }
        self.ctx.borrow_mut().clear_rollback_listener();
        let queued = codec::empty_info(InfoTag::RollbackDone).and_then(|pkt| self.queue_packet(pkt));
        if queued.is_err() {
            self.do_oom_close();
        }
        false
    }

    fn process_packet<B: ServiceBroker>(&mut self, broker: &mut B) -> Result<(), TryReserveError> {
        let Some(tag) = ReqTag::from_u8(self.rbuf.peek(0)) else {
            // unknown tag: framing cannot be trusted past this point
            self.send_error(InfoTag::BadRequest)?;
            self.start_drain_close();
            return Ok(());
        };
        if self.rbuf.len() < tag.header_len() {
            self.chklen = tag.header_len();
            return Ok(());
        }
        match tag {
            ReqTag::FindService | ReqTag::LoadService => self.process_find_load(broker, tag),
            ReqTag::StartService
            | ReqTag::StopService
            | ReqTag::UnpinService
            | ReqTag::UnloadService => self.process_handle_request(broker, tag),
            ReqTag::ListServices => self.process_list(broker),
            ReqTag::Shutdown => self.process_shutdown(broker),
        }
    }

    fn process_find_load<B: ServiceBroker>(
        &mut self,
        broker: &mut B,
        tag: ReqTag,
    ) -> Result<(), TryReserveError> {
        let name_len = self.rbuf.peek_u16_le(1) as usize;
        let total = NAME_REQ_HEADER + name_len;
        if total > RecvBuffer::CAPACITY {
            // could never be buffered whole; treat as malformed
            self.send_error(InfoTag::BadRequest)?;
            self.start_drain_close();
            return Ok(());
        }
        if self.rbuf.len() < total {
            self.chklen = total;
            return Ok(());
        }

        let mut pkt = Vec::new();
        pkt.try_reserve_exact(total)?;
        pkt.resize(total, 0);
        self.rbuf.copy_out(&mut pkt);

        match std::str::from_utf8(&pkt[NAME_REQ_HEADER..]) {
            Ok(name) => match tag {
                ReqTag::FindService => match broker.find_service(name) {
                    Some(service) => self.report_service_record(broker, service)?,
                    None => self.send_error(InfoTag::NoService)?,
                },
                _ => match broker.load_service(name) {
                    Ok(service) => self.report_service_record(broker, service)?,
                    Err(err) => {
                        debug!("control connection {:?}: load failed: {err}", self.id);
                        self.send_error(InfoTag::LoadFailed)?;
                    }
                },
            },
            Err(_) => {
                // a non-UTF-8 name cannot match or load anything
                let reply = if tag == ReqTag::FindService {
                    InfoTag::NoService
                } else {
                    InfoTag::LoadFailed
                };
                self.send_error(reply)?;
            }
        }

        self.rbuf.consume(total);
        self.chklen = 1;
        Ok(())
    }

    fn process_handle_request<B: ServiceBroker>(
        &mut self,
        broker: &mut B,
        tag: ReqTag,
    ) -> Result<(), TryReserveError> {
        let mut raw = [0u8; HANDLE_REQ_LEN];
        self.rbuf.copy_out(&mut raw);
        let handle = Handle::from_raw(u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]]));

        match self.handles.resolve(handle) {
            None => self.send_error(InfoTag::NoService)?,
            Some(service) => match tag {
                ReqTag::StartService => {
                    broker.start_service(service);
                    self.send_error(InfoTag::Ack)?;
                }
                ReqTag::StopService => {
                    broker.stop_service(service);
                    self.send_error(InfoTag::Ack)?;
                }
                ReqTag::UnpinService => {
                    broker.unpin_service(service);
                    self.send_error(InfoTag::Ack)?;
                }
                _ => match broker.unload_service(service) {
                    Ok(()) => {
                        // a retired record must not be reachable through
                        // stale aliases on this connection
                        self.handles.release_service(service);
                        self.send_error(InfoTag::Ack)?;
                    }
                    Err(err) => {
                        debug!("control connection {:?}: unload refused: {err}", self.id);
                        self.send_error(InfoTag::Nak)?;
                    }
                },
            },
        }

        self.rbuf.consume(HANDLE_REQ_LEN);
        self.chklen = 1;
        Ok(())
    }

    fn process_list<B: ServiceBroker>(&mut self, broker: &mut B) -> Result<(), TryReserveError> {
        let mut failed: Option<TryReserveError> = None;
        broker.list_services(&mut |_, name, state| {
            if failed.is_some() {
                return;
            }
            let queued =
                codec::service_info(state, name).and_then(|pkt| self.queue_packet(pkt));
            if let Err(err) = queued {
                failed = Some(err);
            }
        });
        if let Some(err) = failed {
            return Err(err);
        }
        let done = codec::empty_info(InfoTag::ListDone)?;
        self.queue_packet(done)?;

        self.rbuf.consume(1);
        self.chklen = 1;
        Ok(())
    }

    fn process_shutdown<B: ServiceBroker>(&mut self, broker: &mut B) -> Result<(), TryReserveError> {
        broker.begin_shutdown();
        self.ctx.borrow_mut().set_rollback_listener(self.id);
        self.send_error(InfoTag::Ack)?;

        self.rbuf.consume(1);
        self.chklen = 1;
        Ok(())
    }

    /// Allocates a handle for `service` and replies with its state and id.
    fn report_service_record<B: ServiceBroker>(
        &mut self,
        broker: &B,
        service: ServiceId,
    ) -> Result<(), TryReserveError> {
        let handle = {
            let mut ctx = self.ctx.borrow_mut();
            self.handles.allocate(&mut ctx, service)?
        };
        let pkt = codec::service_record(broker.service_state(service), handle)?;
        self.queue_packet(pkt)
    }

    /// Queues one outgoing packet and enables the write watch.
    fn queue_packet(&mut self, pkt: Vec<u8>) -> Result<(), TryReserveError> {
        #[cfg(test)]
        if self.force_oom {
            return Err(synthetic_oom());
        }
        self.outbuf.try_reserve(1)?;
        let was_idle = self.outbuf.is_empty();
        self.outbuf.push_back(pkt);
        if was_idle {
            let interest = if self.bad_conn_close {
                Interest::WRITE
            } else {
                Interest::READ | Interest::WRITE
            };
            self.watch.set_watches(interest);
        }
        Ok(())
    }

    fn send_error(&mut self, tag: InfoTag) -> Result<(), TryReserveError> {
        let pkt = codec::empty_info(tag)?;
        self.queue_packet(pkt)
    }

    fn start_drain_close(&mut self) {
        self.bad_conn_close = true;
        self.watch.set_watches(Interest::WRITE);
    }

    /// Two-phase out-of-memory close: flush what is queued, send the
    /// indicator if the socket allows, then destroy.
    fn do_oom_close(&mut self) {
        warn!("control connection {:?}: out of memory, closing", self.id);
        self.bad_conn_close = true;
        self.oom_close = true;
        self.watch.set_watches(Interest::WRITE);
    }
}

impl<S, W> ServiceListener for ControlConn<S, W>
where
    S: Read + Write,
    W: WatchControl,
{
    /// Broadcast fan-out: one information packet per handle aliasing the
    /// service. An allocation failure here takes the out-of-memory close
    /// path rather than silently dropping the notification.
    fn service_event(&mut self, service: ServiceId, event: ServiceEvent) {
        let mut i = 0;
        loop {
            let Some(handle) = self.handles.handles_for(service).get(i).copied() else {
                break;
            };
            let queued =
                codec::service_event(handle, event).and_then(|pkt| self.queue_packet(pkt));
            if queued.is_err() {
                self.do_oom_close();
                return;
            }
            i += 1;
        }
    }
}

impl<S, W> Drop for ControlConn<S, W> {
    fn drop(&mut self) {
        debug!("control connection {:?} closed", self.id);
        self.handles.release_all();
        self.ctx.borrow_mut().unregister_conn(self.id);
    }
}

#[cfg(test)]
fn synthetic_oom() -> TryReserveError {
    Vec::<u8>::new()
        .try_reserve(usize::MAX)
        .expect_err("reservation of usize::MAX bytes cannot succeed")
}
