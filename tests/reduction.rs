mod common;

use common::queues;
use shardex::{Error, Reductor, Vector, constant, inner_product};

#[test]
fn test_sum_of_scenario_vector() {
    let q = queues(2);
    let x = Vector::from_slice(&q, &[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]).unwrap();
    assert_eq!(Reductor::sum(&q).unwrap().apply(&x).unwrap(), 36.0);
}

#[test]
fn test_sum_power_of_two_and_odd_sizes() {
    for k in [1, 2, 3, 4] {
        let q = queues(k);
        let sum = Reductor::<f64>::sum(&q).unwrap();
        for n in [1usize, 2, 7, 64, 1000, 1023, 1024, 4097] {
            let data: Vec<f64> = (0..n).map(|i| (i % 17) as f64 * 0.25).collect();
            let x = Vector::from_slice(&q, &data).unwrap();
            let want: f64 = data.iter().sum();
            let got = sum.apply(&x).unwrap();
            assert!(
                (got - want).abs() <= 1e-9 * want.abs().max(1.0),
                "k={} n={}: {} != {}",
                k,
                n,
                got,
                want
            );
        }
    }
}

#[test]
fn test_min_max_of_expression() {
    let q = queues(3);
    let data = [3.0f32, -7.5, 12.0, 0.0, 4.25, -1.0, 8.0];
    let x = Vector::from_slice(&q, &data).unwrap();
    assert_eq!(Reductor::max(&q).unwrap().apply(&x).unwrap(), 12.0);
    assert_eq!(Reductor::min(&q).unwrap().apply(&x).unwrap(), -7.5);
    // max |x| through an expression
    let abs_max = Reductor::max(&q).unwrap().apply(shardex::abs(&x)).unwrap();
    assert_eq!(abs_max, 12.0);
}

#[test]
fn test_norm_via_inner_product() {
    let q = queues(4);
    let x = Vector::from_slice(&q, &[3.0f64, 4.0, 0.0, 0.0, 0.0]).unwrap();
    assert_eq!(inner_product(&x, &x).unwrap().sqrt(), 5.0);
}

#[test]
fn test_reduce_needs_a_vector() {
    let q = queues(2);
    let sum = Reductor::<f64>::sum(&q).unwrap();
    assert!(matches!(
        sum.apply(constant(1.0)),
        Err(Error::InvalidExpression(_))
    ));
}

#[test]
fn test_reduction_shape_is_cached() {
    let q = queues(2);
    let ctx = q[0].context().clone();
    let x = Vector::from_slice(&q, &[1.0f64, 2.0, 3.0]).unwrap();
    let y = Vector::from_slice(&q, &[4.0f64, 5.0, 6.0]).unwrap();
    let sum = Reductor::sum(&q).unwrap();
    assert_eq!(sum.apply(&x * &y).unwrap(), 32.0);
    let compiled = ctx.compilations();
    assert_eq!(sum.apply(&y * &x).unwrap(), 32.0);
    assert_eq!(ctx.compilations(), compiled);
    // Same expression under another operator is a different kernel.
    assert_eq!(Reductor::max(&q).unwrap().apply(&x * &y).unwrap(), 18.0);
    assert_eq!(ctx.compilations(), compiled + 1);
}

#[test]
fn test_reduction_buffers_live_until_completion() {
    use shardex::backend::{Command, Event, Staging};
    use shardex_kernels::{Buffer, BufferKind};
    use std::thread;
    use std::time::{Duration, Instant};

    let q = queues(1);
    let ctx = q[0].context().clone();
    let x = Vector::from_slice(&q, &[1.0f64, 2.0, 3.0]).unwrap();

    // Hold the queue behind a staged write that waits on `gate`.
    let gate = Event::new();
    let sink = q[0].alloc(BufferKind::F64, 1).unwrap();
    let staged = Staging::new();
    staged.put(Buffer::F64(vec![0.0]));
    let held = q[0].enqueue(Command::WriteStaged {
        dst: sink.handle().clone(),
        offset: 0,
        from: staged,
        after: gate.clone(),
    });
    let before = ctx.allocated_bytes();

    thread::scope(|s| {
        let sum = s.spawn(|| Reductor::sum(&q).unwrap().apply(&x).unwrap());
        // one f64 partial while the launch is queued
        let deadline = Instant::now() + Duration::from_secs(5);
        while ctx.allocated_bytes() != before + 8 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(50));
        let in_flight = ctx.allocated_bytes();
        gate.complete();
        assert_eq!(in_flight, before + 8);
        assert_eq!(sum.join().unwrap(), 6.0);
    });
    held.wait().unwrap();
    assert_eq!(ctx.allocated_bytes(), before);
}
