mod common;
use pg_cutover::table::{Table, analyze_table_pkeys};
use serial_test::serial;

#[test]
#[serial]
fn splits_tables_by_primary_key() {
    let Some(test_db) = common::setup_test_db() else {
        return;
    };
    let mut client = test_db.get_client();
    client
        .batch_execute(
            "CREATE TABLE orders (id BIGSERIAL PRIMARY KEY, note TEXT);
             CREATE TABLE line_items (order_id BIGINT, position INT, sku TEXT,
                                      PRIMARY KEY (order_id, position));
             CREATE TABLE audit_log (payload TEXT);",
        )
        .unwrap();

    let keys = analyze_table_pkeys(&mut *client, "public").unwrap();
    assert_eq!(keys.with_pkey["orders"], vec!["id".to_string()]);
    assert_eq!(
        keys.with_pkey["line_items"],
        vec!["order_id".to_string(), "position".to_string()]
    );
    assert_eq!(keys.without_pkey, vec!["audit_log".to_string()]);
    assert_eq!(keys.all_tables(), vec!["audit_log", "line_items", "orders"]);

    let scoped = keys.scoped(&["ORDERS".to_string(), "audit_log".to_string()]);
    assert_eq!(scoped.pkey_tables(), vec!["orders".to_string()]);
    assert_eq!(scoped.without_pkey, vec!["audit_log".to_string()]);
}

#[test]
#[serial]
fn emptiness_and_columns() {
    let Some(test_db) = common::setup_test_db() else {
        return;
    };
    let mut client = test_db.get_client();
    client
        .batch_execute("CREATE TABLE orders (id BIGINT PRIMARY KEY, note TEXT)")
        .unwrap();
    let table = Table::new("public", "orders");
    assert!(table.is_empty(&mut *client).unwrap());
    assert_eq!(
        table.get_columns(&mut *client).unwrap(),
        vec!["id".to_string(), "note".to_string()]
    );
    client
        .batch_execute("INSERT INTO orders VALUES (1, 'a')")
        .unwrap();
    assert!(!table.is_empty(&mut *client).unwrap());
}
