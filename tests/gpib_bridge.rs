//! Two SCPI instruments on one GPIB-Ethernet bridge, wired from a configuration file.

use labctl::adapters::{ConnectionRegistry, Endpoint};
use labctl::config::LabConfig;
use labctl::scpi::ScpiInstrument;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Accepts a single client and plays a bridge with two devices at addresses 16 and 19.
async fn fake_bridge(listener: TcpListener, log: Arc<Mutex<Vec<String>>>) {
    let (stream, _) = listener.accept().await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut selected = 0u8;
    let mut last_command: HashMap<u8, String> = HashMap::new();

    while let Ok(Some(line)) = lines.next_line().await {
        log.lock().await.push(line.clone());
        if let Some(addr) = line.strip_prefix("++addr ") {
            selected = addr.parse().unwrap();
        } else if line == "++read eoi" {
            let reply = match (selected, last_command.get(&selected).map(String::as_str)) {
                (19, Some("*IDN?")) => "ACME,SG100,19,1.0\n",
                (16, Some("*IDN?")) => "ACME,VNA40,16,2.3\n",
                (19, Some(":FREQuency:FIXed?")) => "1.5E9\n",
                _ => "0\n",
            };
            write.write_all(reply.as_bytes()).await.unwrap();
        } else if !line.starts_with("++") {
            last_command.insert(selected, line);
        }
    }
}

fn bench_config(port: u16) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[application]
name = "bridge test"

[[instruments]]
id = "sg1"
type = "scpi"
[instruments.transport]
kind = "gpib_bridge"
host = "127.0.0.1"
port = {port}
address = 19
timeout_ms = 2000

[[instruments]]
id = "vna"
type = "scpi"
[instruments.transport]
kind = "gpib_bridge"
host = "127.0.0.1"
port = {port}
address = 16
timeout_ms = 2000
"#
    )
    .unwrap();
    file
}

#[tokio::test]
async fn test_instruments_share_one_bridge_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let log = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(fake_bridge(listener, log.clone()));

    let file = bench_config(port);
    let config = LabConfig::load_from(file.path()).unwrap();
    let registry = ConnectionRegistry::new();

    let mut sg = ScpiInstrument::connect(&registry, config.instrument("sg1").unwrap())
        .await
        .unwrap();
    let mut vna = ScpiInstrument::connect(&registry, config.instrument("vna").unwrap())
        .await
        .unwrap();

    assert_eq!(sg.identify().await.unwrap(), "ACME,SG100,19,1.0");
    assert_eq!(vna.identify().await.unwrap(), "ACME,VNA40,16,2.3");
    assert_eq!(sg.query(":FREQuency:FIXed?", None).await.unwrap(), "1.5E9");

    let endpoint = Endpoint::Tcp {
        host: "127.0.0.1".to_string(),
        port,
    };
    assert_eq!(registry.len().await, 1);
    assert_eq!(registry.owners(&endpoint).await, vec!["sg1", "vna"]);

    let log = log.lock().await.clone();
    assert_eq!(
        &log[..4],
        &["++mode 1", "++auto 0", "++read_tmo_ms 2000", "++eos 3"]
    );
    assert_eq!(log.iter().filter(|l| *l == "++mode 1").count(), 1);
    assert_eq!(
        &log[4..8],
        &["++addr 19", "*IDN?", "++addr 19", "++read eoi"]
    );

    sg.close().await.unwrap();
    assert_eq!(registry.owners(&endpoint).await, vec!["vna"]);
    vna.close().await.unwrap();
    assert!(registry.is_empty().await);
}
