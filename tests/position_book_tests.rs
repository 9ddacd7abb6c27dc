use market_sync::bridge::types::{parse_push_event, PushEvent};
use market_sync::model::position::{PositionKey, Side};
use market_sync::model::symbol::Symbol;
use market_sync::positions::PositionBook;
use serde_json::json;

fn book() -> PositionBook {
    PositionBook::new(0.01, 0.0001, 100_000.0)
}

#[test]
fn close_event_from_the_wire_removes_the_row() {
    let mut b = book();
    b.apply_snapshot(&[
        json!({"Ticket": 111, "Symbol": "EURUSD", "Type": 0, "Volume": 10, "OpenPrice": 1.1000, "CurrentPrice": 1.1004}),
        json!({"Ticket": 112, "Symbol": "GBPUSD", "Type": 1, "Volume": 20, "OpenPrice": 1.2700, "CurrentPrice": 1.2695}),
    ]);
    assert_eq!(b.len(), 2);

    let frame = r#"{"event":"positionClosed","Ticket":111}"#;
    let event = parse_push_event(frame).expect("parses").expect("named event");
    let PushEvent::PositionClosed { ticket } = event else {
        panic!("expected a close event, got {event:?}");
    };
    assert!(b.apply_closed(ticket));
    assert_eq!(b.len(), 1);
    assert_eq!(b.positions()[0].key, PositionKey::Ticket(112));

    // a replayed close is a no-op
    assert!(!b.apply_closed(ticket));
}

#[test]
fn push_update_inserts_until_a_snapshot_reconciles() {
    let mut b = book();
    let frame = r#"{"event":"positionUpdate","data":{"Ticket":500,"Symbol":"EURUSD","Type":0,"Volume":1000,"OpenPrice":1.1000,"Profit":3.5}}"#;
    let Ok(Some(PushEvent::PositionUpdate(row))) = parse_push_event(frame) else {
        panic!("expected an update frame");
    };
    assert!(b.apply_update(&row));
    assert_eq!(b.len(), 1);
    // push volumes are ten-thousandths of a lot
    assert!((b.positions()[0].volume_lots - 0.10).abs() < 1e-9);
    assert!((b.positions()[0].profit - 3.5).abs() < f64::EPSILON);

    // the snapshot reasserts the set at its own centi-lot scale
    b.apply_snapshot(&[
        json!({"Ticket": 500, "Symbol": "EURUSD", "Type": 0, "Volume": 10, "OpenPrice": 1.1000, "Profit": 4.0}),
    ]);
    assert_eq!(b.len(), 1);
    assert!((b.positions()[0].volume_lots - 0.10).abs() < 1e-9);
    assert!((b.positions()[0].profit - 4.0).abs() < f64::EPSILON);
}

#[test]
fn push_snapshot_array_replaces_the_set() {
    let mut b = book();
    b.apply_snapshot(&[
        json!({"Ticket": 9, "Symbol": "USDJPY", "Type": 0, "Volume": 10, "OpenPrice": 155.00}),
    ]);

    let frame = r#"{"event":"positions","data":[
        {"Ticket":21,"Symbol":"EURUSD","Type":0,"Volume":2500,"OpenPrice":1.0990},
        {"Ticket":22,"Symbol":"EURUSD","Type":1,"Volume":2500,"OpenPrice":1.1010}
    ]}"#;
    let event = parse_push_event(frame).expect("parses").expect("named event");
    let PushEvent::Positions(rows) = event else {
        panic!("expected a full-array frame, got {event:?}");
    };
    b.apply_push_snapshot(&rows);

    assert_eq!(b.len(), 2);
    assert!(b.positions().iter().all(|p| p.symbol == Symbol::new("EURUSD")));
    assert!(b
        .positions()
        .iter()
        .all(|p| (p.volume_lots - 0.25).abs() < 1e-9));
}

#[test]
fn quotes_mark_open_float_between_updates() {
    let mut b = book();
    b.apply_snapshot(&[
        json!({"Ticket": 1, "Symbol": "EURUSD", "Type": 0, "Volume": 10, "OpenPrice": 1.1000, "CurrentPrice": 1.1000}),
        json!({"Ticket": 2, "Symbol": "EURUSD", "Type": 1, "Volume": 10, "OpenPrice": 1.1000, "CurrentPrice": 1.1000}),
    ]);
    assert!(b.mark_price(&Symbol::new("EURUSD"), 1.1020));

    let long = b
        .positions()
        .iter()
        .find(|p| p.key == PositionKey::Ticket(1))
        .expect("long row");
    assert!((long.profit - 20.0).abs() < 1e-6);
    let short = b
        .positions()
        .iter()
        .find(|p| p.key == PositionKey::Ticket(2))
        .expect("short row");
    assert!((short.profit - (-20.0)).abs() < 1e-6);

    // the next broker-sent profit overwrites the estimate
    b.apply_update(&json!({
        "Ticket": 1, "Symbol": "EURUSD", "Type": 0, "Volume": 1000,
        "OpenPrice": 1.1000, "Profit": 18.75
    }));
    let long = b
        .positions()
        .iter()
        .find(|p| p.key == PositionKey::Ticket(1))
        .expect("long row");
    assert!((long.profit - 18.75).abs() < f64::EPSILON);
}

#[test]
fn ticketless_rows_stay_visible_but_not_actionable() {
    let mut b = book();
    let frame = r#"{"event":"positionUpdate","data":{"Id":"grid-7","Symbol":"XAUUSD","Side":"sell","Volume":50,"OpenPrice":2400.0}}"#;
    let Ok(Some(PushEvent::PositionUpdate(row))) = parse_push_event(frame) else {
        panic!("expected an update frame");
    };
    assert!(b.apply_update(&row));

    assert_eq!(b.len(), 1);
    let pos = &b.positions()[0];
    assert!(!pos.key.is_actionable());
    assert_eq!(pos.key.ticket(), None);
    assert_eq!(pos.side, Side::Sell);
    assert!((pos.volume_lots - 0.005).abs() < 1e-9);
}
