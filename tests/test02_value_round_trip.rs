use sqlite_sidecar::{Connection, Connector, RowValues};

fn connector() -> Connector {
    Connector::builder()
        .worker_path(env!("CARGO_BIN_EXE_sqlite-sidecar-worker"))
        .finish()
}

async fn round_trip(conn: &Connection, value: RowValues) -> (RowValues, String) {
    let result = conn
        .query(
            "SELECT ? AS v, UPPER(TYPEOF(?)) AS t",
            vec![value.clone(), value],
        )
        .await
        .expect("round-trip query");
    let row = &result.rows[0];
    let type_tag = row
        .get("t")
        .and_then(|v| v.as_text())
        .expect("type tag")
        .to_string();
    (row.get("v").expect("value cell").clone(), type_tag)
}

#[tokio::test]
async fn scalars_preserve_value_and_engine_type() -> Result<(), Box<dyn std::error::Error>> {
    let conn = connector().open(":memory:", None).await?;

    let cases: Vec<(RowValues, RowValues, &str)> = vec![
        (RowValues::Int(42), RowValues::Int(42), "INTEGER"),
        (RowValues::Int(-1), RowValues::Int(-1), "INTEGER"),
        (RowValues::Float(1.5), RowValues::Float(1.5), "REAL"),
        (RowValues::Null, RowValues::Null, "NULL"),
        (
            RowValues::Text("plain text".into()),
            RowValues::Text("plain text".into()),
            "TEXT",
        ),
        (
            RowValues::Text("ünïcødé \u{1F980}".into()),
            RowValues::Text("ünïcødé \u{1F980}".into()),
            "TEXT",
        ),
        // Ordinary whitespace control characters stay text.
        (
            RowValues::Text("a\tb\rc\nd".into()),
            RowValues::Text("a\tb\rc\nd".into()),
            "TEXT",
        ),
        (
            RowValues::Blob(vec![0x00, 0x01, 0x02]),
            RowValues::Blob(vec![0x00, 0x01, 0x02]),
            "BLOB",
        ),
        (
            RowValues::Blob(b"embedded\x00nul".to_vec()),
            RowValues::Blob(b"embedded\x00nul".to_vec()),
            "BLOB",
        ),
        (RowValues::Blob(Vec::new()), RowValues::Blob(Vec::new()), "BLOB"),
        // Booleans bind as integers.
        (RowValues::Bool(true), RowValues::Int(1), "INTEGER"),
        (RowValues::Bool(false), RowValues::Int(0), "INTEGER"),
    ];

    for (sent, expected, expected_type) in cases {
        let (got, type_tag) = round_trip(&conn, sent.clone()).await;
        assert_eq!(got, expected, "value mismatch for {sent:?}");
        assert_eq!(type_tag, expected_type, "type mismatch for {sent:?}");
    }

    conn.quit().await?;
    Ok(())
}

#[tokio::test]
async fn zero_float_stays_real() -> Result<(), Box<dyn std::error::Error>> {
    let conn = connector().open(":memory:", None).await?;
    let (got, type_tag) = round_trip(&conn, RowValues::Float(0.0)).await;
    assert_eq!(got, RowValues::Float(0.0));
    assert_eq!(type_tag, "REAL");
    conn.quit().await?;
    Ok(())
}

#[tokio::test]
async fn control_characters_coerce_text_to_blob() -> Result<(), Box<dyn std::error::Error>> {
    let conn = connector().open(":memory:", None).await?;

    // Text carrying a C0 control byte travels as a blob and comes back
    // as the same bytes.
    let (got, type_tag) = round_trip(&conn, RowValues::Text("a\x01b".into())).await;
    assert_eq!(got, RowValues::Blob(b"a\x01b".to_vec()));
    assert_eq!(type_tag, "BLOB");

    conn.quit().await?;
    Ok(())
}

#[tokio::test]
async fn named_parameters_bind_with_and_without_sigil() -> Result<(), Box<dyn std::error::Error>> {
    let conn = connector().open(":memory:", None).await?;

    let result = conn
        .query(
            "SELECT :a AS a, @b AS b",
            [("a", RowValues::Int(1)), ("@b", RowValues::Int(2))],
        )
        .await?;
    assert_eq!(result.rows[0].get("a"), Some(&RowValues::Int(1)));
    assert_eq!(result.rows[0].get("b"), Some(&RowValues::Int(2)));

    conn.quit().await?;
    Ok(())
}

#[tokio::test]
async fn stored_blobs_read_back_byte_exact() -> Result<(), Box<dyn std::error::Error>> {
    let conn = connector().open(":memory:", None).await?;
    let payload: Vec<u8> = (0..=255).collect();

    conn.exec("CREATE TABLE bin (data BLOB)").await?;
    conn.query(
        "INSERT INTO bin VALUES (?)",
        [RowValues::Blob(payload.clone())],
    )
    .await?;

    let result = conn.query("SELECT data FROM bin", ()).await?;
    assert_eq!(result.rows[0].get("data"), Some(&RowValues::Blob(payload)));

    conn.quit().await?;
    Ok(())
}

#[tokio::test]
async fn multi_row_results_keep_order_and_nulls() -> Result<(), Box<dyn std::error::Error>> {
    let conn = connector().open(":memory:", None).await?;

    conn.exec("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT)")
        .await?;
    conn.exec("INSERT INTO t (v) VALUES ('a'), (NULL), ('c')")
        .await?;

    let result = conn.query("SELECT v FROM t ORDER BY id", ()).await?;
    let values: Vec<_> = result.rows.iter().map(|r| r.get("v").cloned()).collect();
    assert_eq!(
        values,
        vec![
            Some(RowValues::Text("a".into())),
            Some(RowValues::Null),
            Some(RowValues::Text("c".into())),
        ]
    );

    conn.quit().await?;
    Ok(())
}
