//! Buffered, checksummed, producer/consumer byte stream.
//!
//! A stream owns a small pool of 64 KiB buffers that shuttle between a
//! producer and a consumer over two bounded channels ("full" one way,
//! "recycled" the other).  One side is always the saved-state engine; the
//! other is either an optional dedicated I/O worker thread or, when no
//! worker is running, the engine itself draining inline.
//!
//! The rolling CRC-32 is maintained lazily: a cursor tracks how much of the
//! current buffer has been folded in, and the gap is processed in one go on
//! `tell`, on any buffer transition, and on [`Strm::cur_crc`].  `peek_at`
//! never advances the CRC.
//!
//! The first failure (backend error, low disk, cancellation) is latched
//! into a sticky status word; every later operation short-circuits to it.

pub mod backend;
pub(crate) mod buffer;

pub use backend::{FileBackend, MemBackend, SeekMethod, StrmBackend};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error};

use crate::err::{SsmError, SsmResult};
use buffer::{StrmBuf, STRM_BUF_SIZE, STRM_IDLE_FLUSH_MS};

/// Liveness tick for all blocking waits: long enough to be free in the
/// steady state, short enough that a stuck peer is noticed.
const LIVENESS_TICK: Duration = Duration::from_secs(30);

/// Default pool sizes.
pub const STRM_BUFFERS_WRITE: usize = 8;
pub const STRM_BUFFERS_READ: usize = 8;
pub const STRM_BUFFERS_VALIDATE: usize = 1;

// ─────────────────────────────────────────────────────────────────────────────
// Shared state (engine side + I/O worker)
// ─────────────────────────────────────────────────────────────────────────────

struct StrmShared {
    backend: Mutex<Box<dyn StrmBackend>>,
    rc: Mutex<Option<SsmError>>,
    terminating: AtomicBool,
    head_tx: Sender<StrmBuf>,
    head_rx: Receiver<StrmBuf>,
    free_tx: Sender<StrmBuf>,
    free_rx: Receiver<StrmBuf>,
    quit_tx: Sender<()>,
    quit_rx: Receiver<()>,
    write: bool,
    file_backed: bool,
}

impl StrmShared {
    fn rc(&self) -> Option<SsmError> {
        *self.rc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latch the first error; later ones are dropped.
    fn set_rc(&self, e: SsmError) {
        let mut g = self.rc.lock().unwrap_or_else(PoisonError::into_inner);
        if g.is_none() {
            *g = Some(e);
        }
    }

    fn be(&self) -> MutexGuard<'_, Box<dyn StrmBackend>> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn terminating(&self) -> bool {
        self.terminating.load(Ordering::Relaxed)
    }
}

/// Flush one full buffer to the backend (consumer side of a write stream).
fn write_buf(sh: &StrmShared, buf: &StrmBuf) -> SsmResult<()> {
    let mut be = sh.be();
    if sh.file_backed {
        be.is_ok()?;
    }
    if buf.cb > 0 {
        be.write(buf.off_stream, &buf.data[..buf.cb])?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// I/O worker loops
// ─────────────────────────────────────────────────────────────────────────────

fn io_write_loop(sh: Arc<StrmShared>) {
    loop {
        crossbeam_channel::select! {
            recv(sh.head_rx) -> msg => {
                let Ok(buf) = msg else { break };
                let end = buf.end_of_stream;
                let res = write_buf(&sh, &buf);
                let _ = sh.free_tx.send(buf);
                if let Err(e) = res {
                    error!("saved-state i/o worker: write failed: {e}");
                    sh.set_rc(e);
                    break;
                }
                if end {
                    break;
                }
            }
            recv(sh.quit_rx) -> _ => break,
            default(LIVENESS_TICK) => {
                if sh.terminating() || sh.rc().is_some() {
                    break;
                }
            }
        }
    }
    debug!("saved-state i/o worker (write) terminating");
}

fn io_read_loop(sh: Arc<StrmShared>, mut off: u64) {
    'outer: loop {
        let mut buf;
        crossbeam_channel::select! {
            recv(sh.free_rx) -> msg => {
                let Ok(b) = msg else { break };
                buf = b;
            }
            recv(sh.quit_rx) -> _ => break,
            default(LIVENESS_TICK) => {
                if sh.terminating() || sh.rc().is_some() {
                    break;
                }
                continue;
            }
        }

        buf.reset(off);
        let res = sh.be().read(off, &mut buf.data[..]);
        let cb = match res {
            Ok(cb) => cb,
            Err(e) => {
                error!("saved-state i/o worker: read failed: {e}");
                sh.set_rc(e);
                let _ = sh.free_tx.send(buf);
                break;
            }
        };
        buf.cb = cb;
        buf.end_of_stream = cb == 0;
        off += cb as u64;

        let eof = cb == 0;
        let mut pending = buf;
        loop {
            match sh.head_tx.send_timeout(pending, LIVENESS_TICK) {
                Ok(()) => break,
                Err(crossbeam_channel::SendTimeoutError::Timeout(b)) => {
                    if sh.terminating() {
                        break 'outer;
                    }
                    pending = b;
                }
                Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => break 'outer,
            }
        }
        if eof {
            break;
        }
    }
    debug!("saved-state i/o worker (read) terminating");
}

// ─────────────────────────────────────────────────────────────────────────────
// Stream handle
// ─────────────────────────────────────────────────────────────────────────────

/// The buffered stream.  See the module docs for the ownership model.
pub(crate) struct Strm {
    sh: Arc<StrmShared>,
    io_thread: Option<JoinHandle<()>>,
    /// Current buffer owned by the engine side, if any.
    cur: Option<StrmBuf>,
    /// Cursor within `cur`.
    off_cur: usize,
    /// How much of `cur` has been folded into the rolling CRC.
    off_crc: usize,
    /// Absolute stream offset of `cur.data[0]`.
    off_base: u64,
    /// Read streams without a worker: next backend offset to fill from.
    next_fill: u64,
    /// Set by `peek_at`; forces a backend seek before the next inline fill.
    need_seek: bool,
    checksummed: bool,
    crc: crc32fast::Hasher,
    /// Write streams: the end marker has been emitted.
    ended: bool,
}

impl Strm {
    fn new(backend: Box<dyn StrmBackend>, write: bool, n_bufs: usize, checksummed: bool) -> Strm {
        let n_bufs = n_bufs.max(1);
        let (head_tx, head_rx) = bounded(n_bufs);
        let (free_tx, free_rx) = bounded(n_bufs);
        let (quit_tx, quit_rx) = bounded(1);
        for _ in 0..n_bufs {
            // Cannot fail: the channel was sized for exactly this many.
            let _ = free_tx.send(StrmBuf::new());
        }
        let file_backed = backend.is_file();
        Strm {
            sh: Arc::new(StrmShared {
                backend: Mutex::new(backend),
                rc: Mutex::new(None),
                terminating: AtomicBool::new(false),
                head_tx,
                head_rx,
                free_tx,
                free_rx,
                quit_tx,
                quit_rx,
                write,
                file_backed,
            }),
            io_thread: None,
            cur: None,
            off_cur: 0,
            off_crc: 0,
            off_base: 0,
            next_fill: 0,
            need_seek: false,
            checksummed,
            crc: crc32fast::Hasher::new(),
            ended: false,
        }
    }

    /// New write stream.
    pub fn new_write(backend: Box<dyn StrmBackend>, n_bufs: usize, checksummed: bool) -> Strm {
        Strm::new(backend, true, n_bufs, checksummed)
    }

    /// New read stream.
    pub fn new_read(backend: Box<dyn StrmBackend>, n_bufs: usize, checksummed: bool) -> Strm {
        Strm::new(backend, false, n_bufs, checksummed)
    }

    /// Spawn the dedicated I/O worker.  For read streams the worker picks up
    /// at the first backend offset the engine has not buffered yet, so it is
    /// safe to call after header validation has already consumed data.
    pub fn start_io_thread(&mut self) -> SsmResult<()> {
        if self.io_thread.is_some() {
            return Err(SsmError::StreamError);
        }
        // Drop any quit token left over from an earlier worker so the new
        // one does not exit on arrival.
        while self.sh.quit_rx.try_recv().is_ok() {}
        let sh = Arc::clone(&self.sh);
        let builder = std::thread::Builder::new().name("ssm-strm-io".into());
        let handle = if self.sh.write {
            builder.spawn(move || io_write_loop(sh))
        } else {
            let off = self.next_fill;
            builder.spawn(move || io_read_loop(sh, off))
        };
        self.io_thread = Some(handle.map_err(SsmError::from)?);
        Ok(())
    }

    /// Stop and join the I/O worker (needed before any read-stream seek).
    pub fn stop_io_thread(&mut self) {
        if let Some(h) = self.io_thread.take() {
            self.sh.terminating.store(true, Ordering::Relaxed);
            let _ = self.sh.quit_tx.try_send(());
            // Free channel capacity so a worker blocked handing off a full
            // buffer can complete its send and observe the stop.
            while let Ok(buf) = self.sh.head_rx.try_recv() {
                let _ = self.sh.free_tx.send(buf);
            }
            let _ = h.join();
            self.sh.terminating.store(false, Ordering::Relaxed);
            // Reclaim whatever the worker buffered ahead of us: recycle the
            // full buffers so the pool is whole again, and resume filling
            // right after the bytes the engine still holds.
            self.next_fill = self.off_base + self.cur.as_ref().map_or(0, |c| c.cb as u64);
            while let Ok(buf) = self.sh.head_rx.try_recv() {
                let _ = self.sh.free_tx.send(buf);
            }
            self.need_seek = true;
        }
    }

    fn check_rc(&self) -> SsmResult<()> {
        match self.sh.rc() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Latch an error onto the stream (also used by the engine for
    /// cancellation so in-flight workers stand down).
    pub fn set_error(&self, e: SsmError) {
        self.sh.set_rc(e);
    }

    // ── CRC bookkeeping ──────────────────────────────────────────────────────

    fn advance_crc_to(&mut self, upto: usize) {
        if self.checksummed && upto > self.off_crc {
            if let Some(cur) = &self.cur {
                self.crc.update(&cur.data[self.off_crc..upto]);
            }
        }
        self.off_crc = self.off_crc.max(upto);
    }

    /// CRC-32 of every byte written/consumed so far.
    pub fn cur_crc(&mut self) -> u32 {
        self.advance_crc_to(self.off_cur);
        self.crc.clone().finalize()
    }

    /// Final CRC-32 once the stream is done.
    pub fn final_crc(&mut self) -> u32 {
        self.cur_crc()
    }

    /// Stop folding bytes into the rolling CRC from this point on.
    pub fn disable_checksumming(&mut self) {
        self.advance_crc_to(self.off_cur);
        self.checksummed = false;
    }

    pub fn is_checksummed(&self) -> bool {
        self.checksummed
    }

    // ── Position / size ──────────────────────────────────────────────────────

    /// Current logical stream offset.
    pub fn tell(&mut self) -> u64 {
        self.advance_crc_to(self.off_cur);
        self.off_base + self.off_cur as u64
    }

    pub fn size(&mut self) -> SsmResult<u64> {
        self.sh.be().size()
    }

    pub fn is_file_backed(&self) -> bool {
        self.sh.file_backed
    }

    // ── Write side ───────────────────────────────────────────────────────────

    /// Append bytes (producer only).
    pub fn write(&mut self, mut data: &[u8]) -> SsmResult<()> {
        self.check_rc()?;
        while !data.is_empty() {
            if self.cur.is_none() {
                self.acquire_write_buf()?;
            }
            let cur = self.cur.as_mut().ok_or(SsmError::StreamError)?;
            let n = (STRM_BUF_SIZE - self.off_cur).min(data.len());
            cur.data[self.off_cur..self.off_cur + n].copy_from_slice(&data[..n]);
            self.off_cur += n;
            data = &data[n..];
            if self.off_cur == STRM_BUF_SIZE {
                self.flush_cur(false)?;
            }
        }
        // Keep the worker fed: a partially filled buffer that has been
        // sitting around is flushed rather than kept waiting for more data.
        if self.io_thread.is_some() && self.off_cur > 0 {
            let idle = self
                .cur
                .as_ref()
                .map_or(false, |c| c.birth.elapsed() >= Duration::from_millis(STRM_IDLE_FLUSH_MS));
            if idle {
                self.flush_cur(false)?;
            }
        }
        Ok(())
    }

    /// Mark the stream complete and flush the final buffer.
    pub fn set_end(&mut self) -> SsmResult<()> {
        if !self.sh.write {
            return Err(SsmError::StreamError);
        }
        if self.ended {
            return Ok(());
        }
        self.flush_cur(true)?;
        self.ended = true;
        Ok(())
    }

    fn acquire_write_buf(&mut self) -> SsmResult<()> {
        let mut buf = if self.io_thread.is_some() {
            loop {
                match self.sh.free_rx.recv_timeout(LIVENESS_TICK) {
                    Ok(b) => break b,
                    Err(RecvTimeoutError::Timeout) => {
                        self.check_rc()?;
                        if self.sh.terminating() {
                            return Err(SsmError::StreamError);
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => return Err(SsmError::StreamError),
                }
            }
        } else {
            match self.sh.free_rx.try_recv() {
                Ok(b) => b,
                Err(_) => {
                    self.drain_inline()?;
                    self.sh
                        .free_rx
                        .try_recv()
                        .map_err(|_| SsmError::StreamError)?
                }
            }
        };
        buf.reset(self.off_base);
        self.cur = Some(buf);
        self.off_cur = 0;
        self.off_crc = 0;
        Ok(())
    }

    fn flush_cur(&mut self, end: bool) -> SsmResult<()> {
        if self.cur.is_none() {
            if !end {
                return Ok(());
            }
            // The end marker needs a buffer even when there is no data.
            self.acquire_write_buf()?;
        }
        self.advance_crc_to(self.off_cur);
        let mut buf = self.cur.take().ok_or(SsmError::StreamError)?;
        buf.cb = self.off_cur;
        buf.off_stream = self.off_base;
        buf.end_of_stream = end;
        self.off_base += self.off_cur as u64;
        self.off_cur = 0;
        self.off_crc = 0;
        self.send_head(buf)?;
        if self.io_thread.is_none() {
            self.drain_inline()?;
        }
        Ok(())
    }

    fn send_head(&mut self, buf: StrmBuf) -> SsmResult<()> {
        let mut pending = buf;
        loop {
            match self.sh.head_tx.send_timeout(pending, LIVENESS_TICK) {
                Ok(()) => return Ok(()),
                Err(crossbeam_channel::SendTimeoutError::Timeout(b)) => {
                    pending = b;
                    self.check_rc()?;
                    if self.sh.terminating() {
                        return Err(SsmError::StreamError);
                    }
                }
                Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                    return Err(self.sh.rc().unwrap_or(SsmError::StreamError));
                }
            }
        }
    }

    /// Consumer work when no I/O worker is running: write out everything
    /// queued and recycle the buffers.
    fn drain_inline(&mut self) -> SsmResult<()> {
        while let Ok(buf) = self.sh.head_rx.try_recv() {
            let res = write_buf(&self.sh, &buf);
            let _ = self.sh.free_tx.send(buf);
            if let Err(e) = res {
                self.sh.set_rc(e);
                return Err(e);
            }
        }
        Ok(())
    }

    // ── Read side ────────────────────────────────────────────────────────────

    /// Read exactly `out.len()` bytes (consumer only).
    pub fn read(&mut self, out: &mut [u8]) -> SsmResult<()> {
        self.check_rc()?;
        let mut done = 0usize;
        while done < out.len() {
            let avail = self.cur_avail();
            if avail == 0 {
                self.next_read_buf()?;
                continue;
            }
            let cur = self.cur.as_ref().ok_or(SsmError::StreamError)?;
            let n = avail.min(out.len() - done);
            out[done..done + n].copy_from_slice(&cur.data[self.off_cur..self.off_cur + n]);
            self.off_cur += n;
            done += n;
        }
        Ok(())
    }

    /// Borrow `n` bytes straight out of the current buffer when it wholly
    /// contains them; `None` sends the caller to the copying path.
    pub fn read_direct(&mut self, n: usize) -> Option<&[u8]> {
        if self.cur_avail() < n {
            return None;
        }
        let off = self.off_cur;
        self.off_cur += n;
        self.cur.as_ref().map(|c| &c.data[off..off + n])
    }

    fn cur_avail(&self) -> usize {
        self.cur.as_ref().map_or(0, |c| c.cb - self.off_cur)
    }

    fn next_read_buf(&mut self) -> SsmResult<()> {
        if let Some(cur) = &self.cur {
            if cur.end_of_stream {
                return Err(SsmError::Io(std::io::ErrorKind::UnexpectedEof));
            }
        }
        // Retire the exhausted buffer: finish its CRC and recycle it.
        if let Some(buf) = self.cur.take() {
            self.advance_crc_to_retired(&buf);
            self.off_base += buf.cb as u64;
            let _ = self.sh.free_tx.send(buf);
        }
        self.off_cur = 0;
        self.off_crc = 0;

        if self.io_thread.is_some() {
            let buf = loop {
                match self.sh.head_rx.recv_timeout(LIVENESS_TICK) {
                    Ok(b) => break b,
                    Err(RecvTimeoutError::Timeout) => {
                        self.check_rc()?;
                        if self.sh.terminating() {
                            return Err(SsmError::StreamError);
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => return Err(SsmError::StreamError),
                }
            };
            self.off_base = buf.off_stream;
            let empty = buf.cb == 0;
            self.cur = Some(buf);
            if empty {
                return Err(SsmError::Io(std::io::ErrorKind::UnexpectedEof));
            }
        } else {
            let mut buf = self
                .sh
                .free_rx
                .try_recv()
                .map_err(|_| SsmError::StreamError)?;
            let off = self.next_fill;
            buf.reset(off);
            let cb = {
                let mut be = self.sh.be();
                if self.need_seek {
                    be.seek(off as i64, SeekMethod::Begin)?;
                    self.need_seek = false;
                }
                match be.read(off, &mut buf.data[..]) {
                    Ok(cb) => cb,
                    Err(e) => {
                        drop(be);
                        self.sh.set_rc(e);
                        let _ = self.sh.free_tx.send(buf);
                        return Err(e);
                    }
                }
            };
            buf.cb = cb;
            buf.end_of_stream = cb == 0;
            self.next_fill = off + cb as u64;
            self.off_base = off;
            let empty = cb == 0;
            self.cur = Some(buf);
            if empty {
                return Err(SsmError::Io(std::io::ErrorKind::UnexpectedEof));
            }
        }
        Ok(())
    }

    /// CRC the untouched tail of a retired read buffer.
    fn advance_crc_to_retired(&mut self, buf: &StrmBuf) {
        if self.checksummed && buf.cb > self.off_crc {
            self.crc.update(&buf.data[self.off_crc..buf.cb]);
        }
    }

    /// Non-destructive read at an arbitrary offset.  Never advances the
    /// CRC or the sequential cursor; only valid while no I/O worker runs.
    pub fn peek_at(&mut self, off: u64, out: &mut [u8]) -> SsmResult<usize> {
        if self.io_thread.is_some() {
            return Err(SsmError::StreamError);
        }
        let n = self.sh.be().read(off, out)?;
        self.need_seek = true;
        Ok(n)
    }

    /// Reposition a read stream and restart the rolling CRC from `crc_seed`.
    /// Invalid on write streams and while an I/O worker is active.
    pub fn seek(&mut self, off: i64, method: SeekMethod, crc_seed: u32) -> SsmResult<()> {
        if self.sh.write || self.io_thread.is_some() {
            return Err(SsmError::StreamError);
        }
        self.check_rc()?;
        let abs = self.sh.be().seek(off, method)?;
        if let Some(buf) = self.cur.take() {
            let _ = self.sh.free_tx.send(buf);
        }
        self.off_cur = 0;
        self.off_crc = 0;
        self.off_base = abs;
        self.next_fill = abs;
        self.need_seek = false;
        self.crc = crc32fast::Hasher::new_with_initial(crc_seed);
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Close the stream.  `cancelled` marks an abandoned operation: the
    /// backend is told so it can undo partial output.
    pub fn close(mut self, cancelled: bool) -> SsmResult<()> {
        let mut failed = cancelled || self.sh.rc().is_some();
        if self.sh.write && !failed {
            if let Err(e) = self.set_end() {
                self.sh.set_rc(e);
                failed = true;
            }
        }
        if failed || !self.sh.write {
            // Write workers exit on the end marker; everything else must be
            // told to stop, with channel room made so a blocked handoff can
            // complete first.
            self.stop_io_thread();
        } else if let Some(h) = self.io_thread.take() {
            let _ = h.join();
        }
        let rc = self.sh.rc();
        let close_res = self.sh.be().close(cancelled || rc.is_some());
        match rc {
            Some(e) if !cancelled => Err(e),
            _ => close_res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_all(strm: &mut Strm, data: &[u8]) {
        strm.write(data).unwrap();
    }

    #[test]
    fn roundtrip_without_io_thread() {
        let be = MemBackend::new();
        let bytes = be.bytes();
        let mut w = Strm::new_write(Box::new(be.clone()), 2, true);
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i * 7) as u8).collect();
        write_all(&mut w, &payload);
        let crc_written = w.final_crc();
        w.close(false).unwrap();

        assert_eq!(bytes.lock().unwrap().len(), payload.len());
        assert_eq!(crc_written, crc32fast::hash(&payload));

        let mut r = Strm::new_read(Box::new(MemBackend::from_bytes(be.to_vec())), 2, true);
        let mut out = vec![0u8; payload.len()];
        r.read(&mut out).unwrap();
        assert_eq!(out, payload);
        assert_eq!(r.final_crc(), crc32fast::hash(&payload));
        r.close(false).unwrap();
    }

    #[test]
    fn roundtrip_with_io_thread() {
        let be = MemBackend::new();
        let mut w = Strm::new_write(Box::new(be.clone()), 3, true);
        w.start_io_thread().unwrap();
        let payload: Vec<u8> = (0..500_000u32).map(|i| (i % 251) as u8).collect();
        write_all(&mut w, &payload);
        w.close(false).unwrap();
        assert_eq!(be.to_vec(), payload);

        let mut r = Strm::new_read(Box::new(MemBackend::from_bytes(be.to_vec())), 3, true);
        r.start_io_thread().unwrap();
        let mut out = vec![0u8; payload.len()];
        r.read(&mut out).unwrap();
        assert_eq!(out, payload);
        assert_eq!(r.final_crc(), crc32fast::hash(&payload));
        r.close(false).unwrap();
    }

    /// The rolling CRC must be independent of buffer boundaries and chunk
    /// sizes: many tiny writes equal one big hash.
    #[test]
    fn crc_ignores_buffering() {
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 13) as u8).collect();
        let mut w = Strm::new_write(Box::new(MemBackend::new()), 2, true);
        for chunk in payload.chunks(977) {
            write_all(&mut w, chunk);
        }
        assert_eq!(w.cur_crc(), crc32fast::hash(&payload));
        w.close(false).unwrap();
    }

    #[test]
    fn tell_tracks_position_across_buffers() {
        let mut w = Strm::new_write(Box::new(MemBackend::new()), 2, false);
        assert_eq!(w.tell(), 0);
        write_all(&mut w, &[0u8; 10]);
        assert_eq!(w.tell(), 10);
        write_all(&mut w, &vec![1u8; STRM_BUF_SIZE]);
        assert_eq!(w.tell(), 10 + STRM_BUF_SIZE as u64);
        w.close(false).unwrap();
    }

    #[test]
    fn peek_does_not_disturb_sequential_reads_or_crc() {
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 101) as u8).collect();
        let mut r = Strm::new_read(Box::new(MemBackend::from_bytes(data.clone())), 2, true);

        let mut head = [0u8; 16];
        r.read(&mut head).unwrap();
        assert_eq!(head, data[..16]);

        let mut peeked = [0u8; 8];
        assert_eq!(r.peek_at(140_000, &mut peeked).unwrap(), 8);
        assert_eq!(peeked, data[140_000..140_008]);

        let mut rest = vec![0u8; data.len() - 16];
        r.read(&mut rest).unwrap();
        assert_eq!(rest, data[16..]);
        assert_eq!(r.final_crc(), crc32fast::hash(&data));
        r.close(false).unwrap();
    }

    #[test]
    fn seek_reseeds_crc() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 97) as u8).collect();
        let mut r = Strm::new_read(Box::new(MemBackend::from_bytes(data.clone())), 1, true);
        let mut first = vec![0u8; 70_000];
        r.read(&mut first).unwrap();
        let crc_at_70k = r.cur_crc();

        r.seek(70_000, SeekMethod::Begin, crc_at_70k).unwrap();
        let mut rest = vec![0u8; 30_000];
        r.read(&mut rest).unwrap();
        assert_eq!(rest, data[70_000..]);
        assert_eq!(r.final_crc(), crc32fast::hash(&data));
        r.close(false).unwrap();
    }

    #[test]
    fn reading_past_eof_fails() {
        let mut r = Strm::new_read(Box::new(MemBackend::from_bytes(vec![1, 2, 3])), 1, false);
        let mut out = [0u8; 3];
        r.read(&mut out).unwrap();
        let mut more = [0u8; 1];
        assert_eq!(
            r.read(&mut more),
            Err(SsmError::Io(std::io::ErrorKind::UnexpectedEof))
        );
        r.close(false).unwrap();
    }

    #[test]
    fn seek_rejected_while_io_thread_runs() {
        let mut r = Strm::new_read(Box::new(MemBackend::from_bytes(vec![0u8; 1024])), 2, false);
        r.start_io_thread().unwrap();
        assert_eq!(r.seek(0, SeekMethod::Begin, 0), Err(SsmError::StreamError));
        r.stop_io_thread();
        r.seek(0, SeekMethod::Begin, 0).unwrap();
        let mut out = [0u8; 4];
        r.read(&mut out).unwrap();
        r.close(false).unwrap();
    }

    #[test]
    fn sticky_error_short_circuits() {
        let mut w = Strm::new_write(Box::new(MemBackend::new()), 1, false);
        w.set_error(SsmError::LowOnDiskSpace);
        assert_eq!(w.write(&[1]), Err(SsmError::LowOnDiskSpace));
        assert_eq!(w.close(true).err(), None);
    }

    #[test]
    fn read_direct_borrows_within_buffer() {
        let data: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        let mut r = Strm::new_read(Box::new(MemBackend::from_bytes(data.clone())), 1, false);
        let mut first = [0u8; 1];
        r.read(&mut first).unwrap();
        let got = r.read_direct(16).expect("within one buffer").to_vec();
        assert_eq!(got, data[1..17]);
        // An oversized request falls back to the copying path.
        assert!(r.read_direct(STRM_BUF_SIZE).is_none());
        r.close(false).unwrap();
    }
}
