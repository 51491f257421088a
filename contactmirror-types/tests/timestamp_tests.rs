use contactmirror_types::HybridTimestamp;

// ── Construction ─────────────────────────────────────────────────

#[test]
fn now_has_zero_logical() {
    let ts = HybridTimestamp::now();
    assert_eq!(ts.logical(), 0);
    assert!(ts.wall_time() > 0);
}

#[test]
fn new_from_components() {
    let ts = HybridTimestamp::new(42, 7);
    assert_eq!(ts.wall_time(), 42);
    assert_eq!(ts.logical(), 7);
}

#[test]
fn default_is_zero() {
    assert_eq!(HybridTimestamp::default(), HybridTimestamp::ZERO);
}

// ── Ordering ─────────────────────────────────────────────────────

#[test]
fn ordering_by_wall_time() {
    let a = HybridTimestamp::new(100, 0);
    let b = HybridTimestamp::new(200, 0);
    assert!(a < b);
}

#[test]
fn ordering_by_logical_when_wall_time_equal() {
    let a = HybridTimestamp::new(100, 0);
    let b = HybridTimestamp::new(100, 1);
    assert!(a < b);
}

// ── tick ─────────────────────────────────────────────────────────

#[test]
fn tick_is_strictly_monotonic() {
    let mut ts = HybridTimestamp::now();
    for _ in 0..1000 {
        let next = ts.tick();
        assert!(next > ts);
        ts = next;
    }
}

#[test]
fn tick_from_future_bumps_logical() {
    let future = HybridTimestamp::new(u64::MAX / 2, 3);
    let next = future.tick();
    assert_eq!(next.wall_time(), future.wall_time());
    assert_eq!(next.logical(), 4);
}

// ── Watermarks ───────────────────────────────────────────────────

#[test]
fn everything_is_after_missing_watermark() {
    assert!(HybridTimestamp::ZERO.is_after_watermark(None));
}

#[test]
fn watermark_is_exclusive() {
    let mark = HybridTimestamp::new(10, 2);
    assert!(!mark.is_after_watermark(Some(&mark)));
    assert!(HybridTimestamp::new(10, 3).is_after_watermark(Some(&mark)));
    assert!(!HybridTimestamp::new(9, 99).is_after_watermark(Some(&mark)));
}

#[test]
fn serde_roundtrip() {
    let ts = HybridTimestamp::new(1_700_000_000_000, 12);
    let json = serde_json::to_string(&ts).unwrap();
    let back: HybridTimestamp = serde_json::from_str(&json).unwrap();
    assert_eq!(ts, back);
}

#[test]
fn display_shows_both_components() {
    assert_eq!(HybridTimestamp::new(5, 1).to_string(), "5.1");
}
