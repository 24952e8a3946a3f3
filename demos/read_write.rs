// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Walkthrough: create a table, write points three ways, query them back.

use std::time::Duration;

use chrono::Local;
use tsdb_client::{
    db_client::{Builder, DbClient, Mode},
    model::{
        sql_query::{display::CsvFormatter, Request as SqlQueryRequest},
        value::Value,
        write::{point::PointBuilder, Request as WriteRequest},
    },
    RpcContext,
};

async fn create_table(client: &dyn DbClient, ctx: &RpcContext) -> anyhow::Result<()> {
    let create_table_sql = r#"CREATE TABLE machine_table (
        ts TIMESTAMP NOT NULL,
        city STRING TAG,
        ip STRING TAG,
        cpu DOUBLE,
        mem DOUBLE,
        TIMESTAMP KEY(ts)) ENGINE=Analytic with (enable_ttl='false')"#;

    let req = SqlQueryRequest::new(create_table_sql)
        .for_tables(vec!["machine_table".to_string()]);
    let resp = client.sql_query(ctx, &req).await?;
    println!("Create table success, affected_rows:{}", resp.affected_rows);
    Ok(())
}

async fn drop_table(client: &dyn DbClient, ctx: &RpcContext) -> anyhow::Result<()> {
    let req = SqlQueryRequest::new("DROP TABLE machine_table")
        .for_tables(vec!["machine_table".to_string()]);
    client.sql_query(ctx, &req).await?;
    println!("Drop table success");
    Ok(())
}

async fn write(client: &dyn DbClient, ctx: &RpcContext) -> anyhow::Result<()> {
    let ts = Local::now().timestamp_millis();
    let mut req = WriteRequest::default();
    req.add_points(vec![
        PointBuilder::new("machine_table".to_string())
            .timestamp(ts)
            .tag("city".to_string(), Value::String("Singapore".to_string()))
            .tag("ip".to_string(), Value::String("10.0.0.1".to_string()))
            .field("cpu".to_string(), Value::Double(0.23))
            .field("mem".to_string(), Value::Double(0.55))
            .build()
            .unwrap(),
        PointBuilder::new("machine_table".to_string())
            .timestamp(ts + 40)
            .tag("city".to_string(), Value::String("Shanghai".to_string()))
            .tag("ip".to_string(), Value::String("10.0.0.2".to_string()))
            .field("cpu".to_string(), Value::Double(0.21))
            .field("mem".to_string(), Value::Double(0.52))
            .build()
            .unwrap(),
    ]);

    let resp = client.write(ctx, &req).await?;
    println!("Write success:{} failed:{}", resp.success, resp.failed);
    Ok(())
}

async fn stream_write(client: &dyn DbClient, ctx: &RpcContext) -> anyhow::Result<()> {
    let ts = Local::now().timestamp_millis();
    let mut writer = client.stream_writer(ctx, "machine_table").await?;

    for i in 0..100 {
        let point = PointBuilder::new("machine_table".to_string())
            .timestamp(ts + i)
            .tag("city".to_string(), Value::String("Beijing".to_string()))
            .tag("ip".to_string(), Value::String("10.0.0.3".to_string()))
            .field("cpu".to_string(), Value::Double(0.3))
            .field("mem".to_string(), Value::Double(0.6))
            .build()
            .unwrap();
        writer.write_and_flush(vec![point]).await?;
    }

    let resp = writer.completed().await?;
    println!("Stream write success:{}", resp.success);
    Ok(())
}

async fn query(client: &dyn DbClient, ctx: &RpcContext) -> anyhow::Result<()> {
    let req = SqlQueryRequest::new("SELECT * FROM machine_table");
    let resp = client.sql_query(ctx, &req).await?;
    println!("Queried {} rows:", resp.row_count());
    print!("{}", CsvFormatter { resp });
    Ok(())
}

async fn stream_query(client: &dyn DbClient, ctx: &RpcContext) -> anyhow::Result<()> {
    let req = SqlQueryRequest::new("SELECT * FROM machine_table");
    let iter = client
        .blocking_stream_sql_query(ctx, &req, Duration::from_secs(10))
        .await?;

    let count = tokio::task::spawn_blocking(move || {
        let mut count = 0usize;
        for row in iter {
            let _row = row?;
            count += 1;
        }
        Ok::<_, tsdb_client::Error>(count)
    })
    .await??;
    println!("Stream query pulled {count} rows");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A tsdb server must be reachable on this grpc port.
    let client = Builder::new("127.0.0.1:8831".to_string(), Mode::Direct)
        .default_database("public")
        .build()?;
    let ctx = RpcContext::default();

    println!("------------------------------------------------------------------");
    create_table(client.as_ref(), &ctx).await?;
    println!("------------------------------------------------------------------");
    write(client.as_ref(), &ctx).await?;
    println!("------------------------------------------------------------------");
    stream_write(client.as_ref(), &ctx).await?;
    println!("------------------------------------------------------------------");
    query(client.as_ref(), &ctx).await?;
    println!("------------------------------------------------------------------");
    stream_query(client.as_ref(), &ctx).await?;
    println!("------------------------------------------------------------------");
    drop_table(client.as_ref(), &ctx).await?;

    client.shutdown().await;
    Ok(())
}
