//! Voltage S7 Demo
//!
//! Demonstrates the voltage_s7 library features including:
//! - Typed S7 values (S7Value) without a PLC connection
//! - Session negotiation (PDU size, concurrent job budget)
//! - Batched reads, raw DB transfers and concurrent requests
//!
//! Usage: cargo run --bin demo [plc_address]
//! Example: cargo run --bin demo 192.168.0.10:102

use std::sync::Arc;
use std::time::{Duration, Instant};

use voltage_s7::{
    Area, CpuType, S7Client, S7ConnectionConfig, S7Value, ValueItem, DEFAULT_TCP_PORT,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🚀 {}", voltage_s7::info());
    println!("=========================================\n");

    // =========================================================================
    // Part 1: Typed Values (No connection required)
    // =========================================================================
    println!("📦 Part 1: Typed S7 Values");
    println!("--------------------------");

    let values = [
        S7Value::Bool(true),
        S7Value::Byte(0x2A),
        S7Value::Word(1234),
        S7Value::Int(-500),
        S7Value::DWord(100_000),
        S7Value::DInt(-50_000),
        S7Value::Real(std::f32::consts::PI),
    ];
    for value in &values {
        println!(
            "  {} -> as_f64: {:.4}, wire bytes: {}",
            value,
            value.as_f64(),
            value.byte_len()
        );
    }

    // =========================================================================
    // Part 2: Live PLC demo (requires a reachable PLC)
    // =========================================================================
    let Some(address) = std::env::args().nth(1) else {
        println!("\n💡 Pass a PLC address to run the live demo, e.g.:");
        println!("   cargo run --bin demo 192.168.0.10:102");
        return Ok(());
    };
    let (host, port) = match address.split_once(':') {
        Some((host, port)) => (host.to_string(), port.parse()?),
        None => (address, DEFAULT_TCP_PORT),
    };

    println!("\n🔌 Part 2: Session ({host}:{port})");
    println!("--------------------------------");
    let config = S7ConnectionConfig::new(host)
        .with_port(port)
        .with_cpu(CpuType::S71500)
        .with_request_timeout(Duration::from_secs(2));
    let client = Arc::new(S7Client::connect(config).await?);
    println!(
        "  connected: pdu_size={} max_concurrent_jobs={}",
        client.pdu_size(),
        client.max_concurrent_jobs()
    );

    // Batched read: one request, several variables
    println!("\n📖 Part 3: Batched Read");
    println!("-----------------------");
    let mut word = ValueItem::db_word(1, 0);
    let mut real = ValueItem::db_real(1, 4);
    match client.read_items(&mut [&mut word, &mut real]).await {
        Ok(()) => println!("  DB1.DBW0 = {}, DB1.DBD4 = {}", word.value(), real.value()),
        Err(e) => println!("  read failed: {e}"),
    }

    // Raw DB transfer, chunked to the negotiated PDU size
    println!("\n📚 Part 4: Raw DB Read");
    println!("----------------------");
    match client.db_read(1, 0, 64).await {
        Ok(data) => println!("  DB1[0..64] = {:02X?}...", &data[..8.min(data.len())]),
        Err(e) => println!("  db_read failed: {e}"),
    }

    // Concurrent requests within the negotiated job budget
    println!("\n⚡ Part 5: Concurrent Reads");
    println!("---------------------------");
    let started = Instant::now();
    let mut workers = Vec::new();
    for offset in 0..8u32 {
        let client = Arc::clone(&client);
        workers.push(tokio::spawn(async move {
            let mut item = ValueItem::db_word(1, offset * 2);
            client.read_items(&mut [&mut item]).await.map(|_| ())
        }));
    }
    let mut ok = 0;
    for worker in workers {
        if worker.await?.is_ok() {
            ok += 1;
        }
    }
    println!("  {ok}/8 reads completed in {:?}", started.elapsed());

    // Single bit access
    println!("\n🔘 Part 6: Bit Access");
    println!("---------------------");
    match client.read_bit(Area::Marker, 0, 0, 0).await {
        Ok(bit) => println!("  M0.0 = {bit}"),
        Err(e) => println!("  read_bit failed: {e}"),
    }

    let stats = client.stats();
    println!(
        "\n📊 Stats: sent={} received={} timeouts={}",
        stats.requests_sent, stats.responses_received, stats.timeouts
    );

    client.close().await;
    println!("👋 Session closed");
    Ok(())
}
