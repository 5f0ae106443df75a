use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Backpressure, Fill, FrameSink, FrameSource, FrameWriter, SinkStage, SourceStage};
use crate::frame::FrameCmd;
use crate::pool::FramePool;

/// Emits `total` numbered frames, with a zero-length pause every `pause_every`.
struct Counter {
    next: u32,
    total: u32,
    pause_every: Option<u32>,
    paused: bool,
}

impl Counter {
    fn new(total: u32) -> Self {
        Self {
            next: 0,
            total,
            pause_every: None,
            paused: false,
        }
    }
}

impl FrameSource<Vec<u32>> for Counter {
    fn fill(&mut self, buf: &mut Vec<u32>) -> anyhow::Result<Fill> {
        if self.next == self.total {
            return Ok(Fill::End);
        }
        if let Some(every) = self.pause_every {
            if self.next % every == 0 && !self.paused {
                self.paused = true;
                return Ok(Fill::Pending);
            }
        }
        self.paused = false;
        buf.clear();
        buf.push(self.next);
        self.next += 1;
        Ok(Fill::Filled)
    }
}

#[derive(Default)]
struct Collect {
    seen: Vec<u32>,
    flushed: bool,
    fail_at: Option<u32>,
}

impl FrameSink<Vec<u32>> for Collect {
    fn consume(&mut self, buf: &mut Vec<u32>) -> anyhow::Result<()> {
        let value = buf[0];
        if Some(value) == self.fail_at {
            anyhow::bail!("sink rejected frame {}", value);
        }
        self.seen.push(value);
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.flushed = true;
        Ok(())
    }
}

fn pool(capacity: usize) -> Arc<FramePool<Vec<u32>>> {
    Arc::new(FramePool::new(capacity, |_| Ok(Vec::with_capacity(1))).unwrap())
}

#[test]
fn test_source_and_sink_move_every_frame_in_order() -> anyhow::Result<()> {
    let pool = pool(3);
    let cancel = CancellationToken::new();
    let sink = SinkStage::spawn("test-sink", pool.clone(), Collect::default(), cancel.clone())?;
    let mut counter = Counter::new(200);
    counter.pause_every = Some(50);
    let source = SourceStage::spawn(
        "test-source",
        pool.clone(),
        counter,
        Backpressure::Block,
        Duration::from_millis(1),
        cancel,
    )?;

    let (_, source_report) = source.join()?;
    let (collect, sink_report) = sink.join()?;

    assert_eq!(collect.seen, (0..200).collect::<Vec<_>>());
    assert!(collect.flushed);
    assert_eq!(source_report.frames, 200);
    assert_eq!(source_report.pauses, 4);
    assert_eq!(sink_report.frames, 200);
    assert_eq!(pool.reclaim()?, 3);
    Ok(())
}

/// Live input: keeps advancing whether or not a buffer was available.
struct Live {
    next: Arc<AtomicU32>,
    total: u32,
}

impl FrameSource<Vec<u32>> for Live {
    fn fill(&mut self, buf: &mut Vec<u32>) -> anyhow::Result<Fill> {
        let next = self.next.load(Ordering::SeqCst);
        if next >= self.total {
            return Ok(Fill::End);
        }
        buf.clear();
        buf.push(next);
        self.next.store(next + 1, Ordering::SeqCst);
        Ok(Fill::Filled)
    }

    fn discard(&mut self) -> anyhow::Result<Fill> {
        let next = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        if next >= self.total {
            Ok(Fill::End)
        } else {
            Ok(Fill::Filled)
        }
    }
}

#[test]
fn test_drop_discipline_never_stalls_without_consumer() -> anyhow::Result<()> {
    let pool = pool(2);
    let progress = Arc::new(AtomicU32::new(0));
    let source = SourceStage::spawn(
        "live-source",
        pool.clone(),
        Live {
            next: progress.clone(),
            total: 10,
        },
        Backpressure::Drop,
        Duration::from_millis(1),
        CancellationToken::new(),
    )?;

    // the producer runs through its whole input with nobody draining
    while progress.load(Ordering::SeqCst) < 10 {
        std::thread::sleep(Duration::from_millis(1));
    }

    let mut values = Vec::new();
    loop {
        match pool.take_full() {
            FrameCmd::Data(slot) => {
                values.push(slot[0]);
                pool.recycle(slot);
            }
            FrameCmd::EOF => break,
        }
    }
    let (_, report) = source.join()?;
    assert_eq!(values, vec![0, 1]);
    assert_eq!(report.frames, 2);
    assert_eq!(report.dropped, 8);
    Ok(())
}

#[test]
fn test_source_error_still_sends_marker() -> anyhow::Result<()> {
    struct Broken;
    impl FrameSource<Vec<u32>> for Broken {
        fn fill(&mut self, _buf: &mut Vec<u32>) -> anyhow::Result<Fill> {
            anyhow::bail!("decoder exploded")
        }
    }

    let pool = pool(2);
    let cancel = CancellationToken::new();
    let sink = SinkStage::spawn("sink", pool.clone(), Collect::default(), cancel.clone())?;
    let source = SourceStage::spawn(
        "source",
        pool.clone(),
        Broken,
        Backpressure::Block,
        Duration::from_millis(1),
        cancel,
    )?;

    assert!(source.join().is_err());
    let (collect, _) = sink.join()?;
    assert!(collect.flushed);
    assert_eq!(pool.census().empty, 2);
    Ok(())
}

#[test]
fn test_sink_failure_cancels_source_and_drains() -> anyhow::Result<()> {
    let pool = pool(2);
    let cancel = CancellationToken::new();
    let sink = SinkStage::spawn(
        "sink",
        pool.clone(),
        Collect {
            fail_at: Some(5),
            ..Default::default()
        },
        cancel.clone(),
    )?;
    let source = SourceStage::spawn(
        "source",
        pool.clone(),
        Counter::new(u32::MAX),
        Backpressure::Block,
        Duration::from_millis(1),
        cancel.clone(),
    )?;

    let err = sink.join().err().unwrap();
    assert!(format!("{:#}", err).contains("frame 5"));
    assert!(cancel.is_cancelled());
    let (counter, _) = source.join()?;
    assert!(counter.next >= 6);
    assert_eq!(pool.reclaim()?, 2);
    Ok(())
}

#[test]
fn test_cancel_stops_endless_source() -> anyhow::Result<()> {
    let pool = pool(4);
    let cancel = CancellationToken::new();
    let sink = SinkStage::spawn("sink", pool.clone(), Collect::default(), cancel.clone())?;
    let source = SourceStage::spawn(
        "source",
        pool.clone(),
        Counter::new(u32::MAX),
        Backpressure::Block,
        Duration::from_millis(1),
        cancel.clone(),
    )?;

    std::thread::sleep(Duration::from_millis(20));
    cancel.cancel();
    let (_, source_report) = source.join()?;
    let (collect, sink_report) = sink.join()?;
    assert_eq!(source_report.frames, sink_report.frames);
    assert_eq!(collect.seen.len() as u64, sink_report.frames);
    Ok(())
}

#[test]
fn test_sink_panic_reported_on_join() {
    struct Panics;
    impl FrameSink<Vec<u32>> for Panics {
        fn consume(&mut self, _buf: &mut Vec<u32>) -> anyhow::Result<()> {
            panic!("boom")
        }
        fn flush(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let pool = pool(1);
    let cancel = CancellationToken::new();
    let sink = SinkStage::spawn("panicky", pool.clone(), Panics, cancel.clone()).unwrap();
    let slot = pool.borrow_empty();
    pool.submit(slot);
    // the sink keeps recycling until the stream ends
    let slot = pool.borrow_empty();
    pool.submit(slot);
    pool.finish();
    let (err_tx, err_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = err_tx.send(sink.join().err());
    });
    let err = err_rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert!(err.to_string().contains("panicky thread panicked: boom"));
    assert!(cancel.is_cancelled());
    assert_eq!(pool.census().empty, 1);
}

#[test]
fn test_writer_drop_discipline_reports_rejections() -> anyhow::Result<()> {
    let pool = pool(2);
    let writer = FrameWriter::new(pool.clone(), Backpressure::Drop);
    let fill = |buf: &mut Vec<u32>| {
        buf.clear();
        buf.push(9);
        Ok(())
    };
    assert!(writer.write(fill)?);
    assert!(writer.write(fill)?);
    assert!(!writer.write(fill)?);

    let report = writer.report();
    assert_eq!(report.frames, 2);
    assert_eq!(report.dropped, 1);
    assert_eq!(pool.census().full, 2);
    Ok(())
}

#[test]
fn test_writer_block_discipline_waits_for_consumer() -> anyhow::Result<()> {
    let pool = pool(1);
    let cancel = CancellationToken::new();
    let consumed = Arc::new(AtomicUsize::new(0));

    struct Slow(Arc<AtomicUsize>);
    impl FrameSink<Vec<u32>> for Slow {
        fn consume(&mut self, _buf: &mut Vec<u32>) -> anyhow::Result<()> {
            std::thread::sleep(Duration::from_millis(2));
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn flush(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let sink = SinkStage::spawn("slow", pool.clone(), Slow(consumed.clone()), cancel)?;
    let writer = FrameWriter::new(pool.clone(), Backpressure::Block);
    for i in 0..20 {
        assert!(writer.write(|buf| {
            buf.clear();
            buf.push(i);
            Ok(())
        })?);
    }
    writer.close();
    sink.join()?;
    assert_eq!(consumed.load(Ordering::SeqCst), 20);
    assert_eq!(writer.report().dropped, 0);
    Ok(())
}

#[test]
fn test_writer_fill_error_recycles_buffer() {
    let pool = pool(1);
    let writer = FrameWriter::new(pool.clone(), Backpressure::Block);
    let result = writer.write(|_| anyhow::bail!("conversion failed"));
    assert!(result.is_err());
    assert_eq!(pool.census().empty, 1);
}
