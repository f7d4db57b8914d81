//! Tail-drain protocol test.
//!
//! Sends cannot be canceled, so a producer/consumer pair that wants to
//! shut down cleanly ends the stream with a sentinel on a reserved tag:
//! the consumer keeps a window of posted receives, drains data until the
//! sentinel arrives and every sent message is accounted for, then cancels
//! the leftover receives. The test asserts zero message loss and that
//! every leftover cancel is confirmed.

use std::sync::{Arc, Mutex};
use std::thread;

use tagcomm::{ContextBuilder, InprocFabric, ANY_SOURCE};

const NITER: u64 = 100;
const WINDOW: usize = 8;

#[test]
fn test_tail_drain_loses_nothing() {
    let fabric = InprocFabric::with_capacity(2, 16);

    let sender = {
        let fabric = fabric.clone();
        thread::spawn(move || {
            let ctx = ContextBuilder::inproc(fabric, 0).build().unwrap();
            let comm = ctx.communicator().unwrap();
            let mut inflight = Vec::new();
            for i in 0..NITER {
                let mut b = ctx.make_buffer::<u64>(1).unwrap();
                b.as_mut_slice()[0] = i;
                inflight.push(comm.send(&b, 1, 1));
                inflight.retain(|r| !r.is_ready());
                while inflight.len() >= WINDOW {
                    comm.progress();
                    inflight.retain(|r| !r.is_ready());
                }
            }
            comm.wait_all();
            // Every data message is delivered; close the stream.
            let sentinel = ctx.make_buffer::<u64>(1).unwrap();
            comm.send(&sentinel, 1, comm.reserved(0)).wait();
            comm.wait_all();
        })
    };

    let receiver = thread::spawn(move || {
        let ctx = ContextBuilder::inproc(fabric, 1).build().unwrap();
        let comm = ctx.communicator().unwrap();
        let got = Arc::new(Mutex::new(Vec::new()));

        let post = |comm: &tagcomm::Communicator| {
            let got = got.clone();
            let buf = ctx.make_buffer::<u64>(1).unwrap();
            comm.recv_cb(buf, ANY_SOURCE, 1, move |buf, _peer, _tag| {
                got.lock().unwrap().push(buf.as_slice()[0]);
            })
        };

        let mut window: Vec<_> = (0..WINDOW).map(|_| post(&comm)).collect();
        let mut sentinel_buf = ctx.make_buffer::<u64>(1).unwrap();
        let sentinel = comm.recv(&mut sentinel_buf, 0, comm.reserved(0));

        while !sentinel.is_ready() || got.lock().unwrap().len() < NITER as usize {
            comm.progress();
            window.retain(|r| !r.is_ready());
            while window.len() < WINDOW {
                window.push(post(&comm));
            }
        }

        // Stream closed and fully drained: withdraw the leftovers.
        let leftovers = window.len();
        let mut canceled = 0;
        for r in window.iter_mut() {
            if r.cancel() {
                canceled += 1;
            }
        }
        assert_eq!(canceled, leftovers);
        for _ in 0..10 {
            comm.progress();
        }
        comm.wait_all();

        let mut data = got.lock().unwrap().clone();
        data.sort_unstable();
        assert_eq!(data, (0..NITER).collect::<Vec<u64>>());
    });

    sender.join().unwrap();
    receiver.join().unwrap();
}
