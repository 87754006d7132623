// End-to-end runtime scenarios: bus + bindings + scheduler + persistence
// wired together the way main() wires them, against a temp data directory
// and a channel-backed KNX driver.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use domus::blocks::BlockRegistry;
use domus::bus::{AddressBus, AddressDescriptor};
use domus::gateway::{ChannelDriver, Gateway, InboundFrame, OutboundFrame};
use domus::persist::load_config;
use domus::remanent::RemanentStore;
use domus::scheduler::{Runtime, RuntimeConfig, RuntimeHandle};
use domus::telegram::{Telegram, TelegramBroadcaster};
use domus::types::{Direction, Origin};
use domus::value::Value;
use domus::AddressKey;

struct Rig {
    handle: RuntimeHandle,
    bus: Arc<AddressBus>,
    #[allow(dead_code)]
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    #[allow(dead_code)]
    knx_tx: mpsc::Sender<InboundFrame>,
    join: tokio::task::JoinHandle<()>,
}

async fn start_rig(data_dir: &Path) -> Rig {
    std::fs::create_dir_all(data_dir.join("custom_blocks")).unwrap();
    let broadcaster = Arc::new(TelegramBroadcaster::new(500));
    let bus = Arc::new(AddressBus::new(broadcaster));
    let (driver, outbound) = ChannelDriver::new();
    let gateway = Gateway::new(Arc::clone(&bus), Arc::new(driver));
    let mut registry = BlockRegistry::with_builtins();
    registry.load_from_path(&data_dir.join("custom_blocks"));
    let remanent = RemanentStore::load(data_dir.join("remanent.json"));
    let (knx_tx, knx_rx) = mpsc::channel(16);

    let cfg = RuntimeConfig {
        config_path: data_dir.join("logic_config.json"),
        custom_blocks_dir: data_dir.join("custom_blocks"),
        execute_timeout: Duration::from_secs(5),
        checkpoint_interval: Duration::from_secs(60),
        save_debounce: Duration::from_millis(50),
    };
    let (handle, join) = Runtime::start(
        cfg,
        Arc::clone(&bus),
        gateway,
        registry,
        remanent,
        None,
        knx_rx,
    );
    // let the scheduler hydrate before the first command
    tokio::time::sleep(Duration::from_millis(20)).await;
    Rig {
        handle,
        bus,
        outbound,
        knx_tx,
        join,
    }
}

async fn stop_rig(rig: Rig) {
    rig.handle.shutdown().await.unwrap();
    rig.join.await.unwrap();
}

async fn recv_telegram(rx: &mut mpsc::Receiver<Telegram>) -> Telegram {
    tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .expect("telegram within 100ms")
        .expect("stream open")
}

fn ga(key: &str) -> AddressDescriptor {
    let mut desc = AddressDescriptor::new(AddressKey::parse(key).unwrap(), format!("test {key}"));
    if !desc.key.is_internal() {
        desc.dpt = Some("1".into());
    }
    desc
}

// S1: a NOT block bridges an external switch address to an IKO. One API
// write yields exactly the api telegram plus one block-out telegram; a
// repeated identical write yields only the api telegram.
#[tokio::test]
async fn switch_loopback_suppresses_unchanged_output() {
    let dir = tempfile::tempdir().unwrap();
    let rig = start_rig(dir.path()).await;

    rig.handle.create_address(ga("1/1/1")).await.unwrap();
    let info = rig
        .handle
        .instantiate_block("NotGate", None, None)
        .await
        .unwrap();
    let id = info.instance_id.clone();

    rig.handle
        .bind(&id, "E1", Direction::Input, "1/1/1", false)
        .await
        .unwrap();
    rig.handle
        .bind(&id, "A1", Direction::Output, "IKO:n1:A1", true)
        .await
        .unwrap();

    let mut telegrams = rig.bus.broadcaster().subscribe(64);

    rig.handle
        .write_address("1/1/1", Value::Bool(true), Origin::Api)
        .await
        .unwrap();

    let first = recv_telegram(&mut telegrams).await;
    assert_eq!(first.address, "1/1/1");
    assert_eq!(first.new_value, Value::Bool(true));
    assert_eq!(first.origin, Origin::Api);

    let second = recv_telegram(&mut telegrams).await;
    assert_eq!(second.address, "IKO:n1:A1");
    assert_eq!(second.new_value, Value::Bool(false));
    assert_eq!(second.origin, Origin::BlockOut);

    // same value again: the api write is recorded, the unchanged NOT output
    // is suppressed
    rig.handle
        .write_address("1/1/1", Value::Bool(true), Origin::Api)
        .await
        .unwrap();
    let third = recv_telegram(&mut telegrams).await;
    assert_eq!(third.address, "1/1/1");
    assert!(
        tokio::time::timeout(Duration::from_millis(100), telegrams.recv())
            .await
            .is_err(),
        "no second block-out telegram"
    );

    stop_rig(rig).await;
}

// S2: connecting one output to two inputs via BLOCK: shorthand materialises
// exactly one IKO, reused for both bindings.
#[tokio::test]
async fn block_shorthand_deduplicates_ikos() {
    let dir = tempfile::tempdir().unwrap();
    let rig = start_rig(dir.path()).await;

    let a = rig.handle.instantiate_block("NotGate", None, None).await.unwrap();
    let b = rig.handle.instantiate_block("AndGate", None, None).await.unwrap();
    let c = rig.handle.instantiate_block("AndGate", None, None).await.unwrap();

    let shorthand = format!("BLOCK:{}:A1", a.instance_id);
    let key_b = rig
        .handle
        .bind(&b.instance_id, "E1", Direction::Input, &shorthand, false)
        .await
        .unwrap();
    let key_c = rig
        .handle
        .bind(&c.instance_id, "E1", Direction::Input, &shorthand, false)
        .await
        .unwrap();

    assert_eq!(key_b, key_c);
    assert!(key_b.to_string().ends_with(":A1"));

    let internals = rig.bus.list(&domus::bus::AddressFilter {
        internal: Some(true),
        group_label: None,
    });
    assert_eq!(internals.len(), 1, "one IKO for two consumers");

    // the shorthand is never persisted: the config carries the IKO key
    rig.handle
        .write_address(&key_b.to_string(), Value::Bool(true), Origin::Api)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let config = load_config(&dir.path().join("logic_config.json")).unwrap();
    let raw = serde_json::to_string(&config).unwrap();
    assert!(!raw.contains("BLOCK:"), "shorthand leaked into persistence");
    assert!(raw.contains(&key_b.to_string()));

    stop_rig(rig).await;
}

// S3: a Timer feeding its own start input through an IKO oscillates without
// stack overflow or runaway, and the scheduler stays responsive.
#[tokio::test]
async fn timer_self_feedback_terminates() {
    let dir = tempfile::tempdir().unwrap();
    let rig = start_rig(dir.path()).await;

    let timer = rig.handle.instantiate_block("Timer", None, None).await.unwrap();
    let id = timer.instance_id.clone();
    let key = rig
        .handle
        .bind(&id, "A1", Direction::Output, "IKO:osc:A1", true)
        .await
        .unwrap();
    rig.handle
        .bind(&id, "E1", Direction::Input, &key.to_string(), false)
        .await
        .unwrap();

    let mut telegrams = rig.bus.broadcaster().subscribe(512);

    rig.handle
        .set_input(&id, "E2", Value::Real(0.03))
        .await
        .unwrap(); // 1.8 s
    rig.handle.set_input(&id, "E1", Value::Bool(true)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;

    // scheduler still serves commands
    assert!(!rig.handle.list_blocks().await.unwrap().is_empty());

    let mut on_a1 = Vec::new();
    while let Ok(t) = telegrams.try_recv() {
        if t.address == "IKO:osc:A1" {
            on_a1.push(t.new_value.as_bool());
        }
    }
    assert!(on_a1.len() >= 2, "start and expiry telegrams, got {on_a1:?}");
    assert!(on_a1.len() < 50, "no runaway, got {}", on_a1.len());
    for pair in on_a1.windows(2) {
        assert_ne!(pair[0], pair[1], "values alternate: {on_a1:?}");
    }

    stop_rig(rig).await;
}

// S4: instances of an unknown type survive restarts untouched, show up as
// unloadable, refuse triggers, and delete cleanly.
#[tokio::test]
async fn unloadable_instance_retained() {
    let dir = tempfile::tempdir().unwrap();
    let config = serde_json::json!({
        "pages": [],
        "blocks": [
            {
                "instance_id": "90001_SonosController_1_090000",
                "block_type": "SonosController",
                "enabled": true,
                "input_values": {"E1": "kitchen"},
                "input_bindings": {"E1": "IKO:sonos:cmd"},
                "output_bindings": {"A1": "IKO:sonos:state"},
                "vendor_extra": {"room": "kitchen"}
            },
            {
                "instance_id": "90002_EpexSpot_1_090001",
                "block_type": "EpexSpot",
                "enabled": true
            }
        ],
        "positions": {}
    });
    std::fs::create_dir_all(dir.path()).unwrap();
    std::fs::write(
        dir.path().join("logic_config.json"),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();

    let rig = start_rig(dir.path()).await;

    let blocks = rig.handle.list_blocks().await.unwrap();
    assert_eq!(blocks.len(), 2);
    let sonos = blocks
        .iter()
        .find(|b| b.block_type == "SonosController")
        .unwrap();
    assert!(sonos.unloadable);
    assert_eq!(
        sonos.inputs.get("E1").unwrap().binding.as_deref(),
        Some("IKO:sonos:cmd")
    );
    assert_eq!(
        sonos.outputs.get("A1").unwrap().binding.as_deref(),
        Some("IKO:sonos:state")
    );

    // triggering an unloadable instance is an unknown-type error
    let err = rig
        .handle
        .trigger_block("90001_SonosController_1_090000")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown-type");

    // deleting one retained instance keeps the other, verbatim
    rig.handle
        .delete_block("90001_SonosController_1_090000")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let on_disk = std::fs::read_to_string(dir.path().join("logic_config.json")).unwrap();
    assert!(!on_disk.contains("SonosController"));
    assert!(on_disk.contains("EpexSpot"));

    stop_rig(rig).await;
}

// S5: the Timer's remaining time survives a restart via the remanent
// snapshot instead of starting over.
#[tokio::test]
async fn remanent_timer_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let rig = start_rig(dir.path()).await;
        let info = rig.handle.instantiate_block("Timer", None, None).await.unwrap();
        let id = info.instance_id.clone();
        rig.handle.set_input(&id, "E2", Value::Real(0.5)).await.unwrap(); // 30 s
        rig.handle.set_input(&id, "E1", Value::Bool(true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;
        rig.handle.checkpoint().await.unwrap();
        stop_rig(rig).await;
        id
    };

    let rig = start_rig(dir.path()).await;
    let blocks = rig.handle.list_blocks().await.unwrap();
    let timer = blocks.iter().find(|b| b.instance_id == id).expect("timer loaded");
    assert_eq!(timer.outputs.get("A1").unwrap().value, Value::Bool(true));
    let remaining = timer.outputs.get("A2").unwrap().value.as_f64();
    assert!(
        remaining > 25.0 && remaining <= 30.0,
        "continues from ~29s, got {remaining}"
    );
    stop_rig(rig).await;
}

// S6: a slow telegram subscriber is disconnected instead of throttling the
// bus; a fast one sees every telegram in order.
#[tokio::test]
async fn slow_subscriber_disconnected_fast_sees_all() {
    let dir = tempfile::tempdir().unwrap();
    let rig = start_rig(dir.path()).await;
    rig.handle.create_address(ga("2/2/2")).await.unwrap();

    let mut slow = rig.bus.broadcaster().subscribe(4);
    let mut fast = rig.bus.broadcaster().subscribe(256);

    for i in 0..50 {
        rig.handle
            .write_address("2/2/2", Value::Bool(i % 2 == 0), Origin::Api)
            .await
            .unwrap();
    }

    assert_eq!(rig.bus.broadcaster().subscriber_count(), 1);

    for i in 0..50 {
        let t = recv_telegram(&mut fast).await;
        assert_eq!(t.new_value, Value::Bool(i % 2 == 0), "order kept at {i}");
    }

    // the slow one got its buffered head, then the channel closed
    let mut seen = 0;
    while slow.try_recv().is_ok() {
        seen += 1;
    }
    assert!(seen <= 4);
    assert!(matches!(
        slow.try_recv(),
        Err(mpsc::error::TryRecvError::Disconnected)
    ));

    stop_rig(rig).await;
}

// Three failures inside a minute demote a block to disabled; re-enabling
// brings it back.
#[tokio::test]
async fn repeated_failures_demote_block() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("custom_blocks")).unwrap();
    std::fs::write(
        dir.path().join("custom_blocks/faulty.toml"),
        "id = 90100\ntype = \"Faulty\"\nname = \"Faulty\"\n\
         [outputs.A1]\nname = \"Out\"\ntype = \"real\"\nexpr = \"boom(1)\"\n",
    )
    .unwrap();

    let rig = start_rig(dir.path()).await;
    let info = rig.handle.instantiate_block("Faulty", None, None).await.unwrap();
    let id = info.instance_id.clone();

    // the initial run already failed once; two manual triggers hit the limit
    rig.handle.trigger_block(&id).await.unwrap();
    rig.handle.trigger_block(&id).await.unwrap();

    let blocks = rig.handle.list_blocks().await.unwrap();
    let faulty = blocks.iter().find(|b| b.instance_id == id).unwrap();
    assert_eq!(faulty.disabled_reason.as_deref(), Some("repeated-failures"));

    let err = rig.handle.trigger_block(&id).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");

    rig.handle.set_enabled(&id, true).await.unwrap();
    let blocks = rig.handle.list_blocks().await.unwrap();
    let faulty = blocks.iter().find(|b| b.instance_id == id).unwrap();
    assert!(faulty.enabled);

    stop_rig(rig).await;
}

// Deleting an address that a binding references fails with in-use; after
// unbinding it succeeds.
#[tokio::test]
async fn delete_bound_address_fails_in_use() {
    let dir = tempfile::tempdir().unwrap();
    let rig = start_rig(dir.path()).await;

    rig.handle.create_address(ga("3/0/1")).await.unwrap();
    let info = rig.handle.instantiate_block("NotGate", None, None).await.unwrap();
    rig.handle
        .bind(&info.instance_id, "E1", Direction::Input, "3/0/1", false)
        .await
        .unwrap();

    let err = rig.handle.delete_address("3/0/1").await.unwrap_err();
    assert_eq!(err.kind(), "in-use");

    rig.handle
        .unbind(&info.instance_id, "E1", Direction::Input)
        .await
        .unwrap();
    rig.handle.delete_address("3/0/1").await.unwrap();

    stop_rig(rig).await;
}

// Backup export/import round-trips addresses, blocks, bindings, remanent
// state and custom block sources through a single document.
#[tokio::test]
async fn backup_roundtrip_into_fresh_install() {
    let source_dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(source_dir.path().join("custom_blocks")).unwrap();
    std::fs::write(
        source_dir.path().join("custom_blocks/double.toml"),
        "id = 90200\ntype = \"Double\"\nname = \"Double\"\n\
         [inputs.E1]\nname = \"V\"\ntype = \"real\"\ndefault = 0.0\n\
         [outputs.A1]\nname = \"R\"\ntype = \"real\"\nexpr = \"E1 * 2\"\n",
    )
    .unwrap();

    let backup = {
        let rig = start_rig(source_dir.path()).await;
        rig.handle.create_address(ga("4/0/1")).await.unwrap();
        let info = rig.handle.instantiate_block("Double", None, None).await.unwrap();
        rig.handle
            .bind(&info.instance_id, "E1", Direction::Input, "4/0/1", false)
            .await
            .unwrap();
        rig.handle
            .bind(&info.instance_id, "A1", Direction::Output, "IKO:dbl:A1", true)
            .await
            .unwrap();
        let backup = rig.handle.export_backup().await.unwrap();
        stop_rig(rig).await;
        backup
    };

    let fresh_dir = tempfile::tempdir().unwrap();
    let rig = start_rig(fresh_dir.path()).await;
    rig.handle.import_backup(backup).await.unwrap();

    // the custom type came along inside the document
    assert!(fresh_dir.path().join("custom_blocks/double.toml").exists());
    let blocks = rig.handle.list_blocks().await.unwrap();
    assert_eq!(blocks.len(), 1);
    assert!(!blocks[0].unloadable);

    // and the wiring works end to end
    let mut telegrams = rig.bus.broadcaster().subscribe(32);
    rig.handle
        .write_address("IKO:dbl:A1", Value::Real(0.0), Origin::Api)
        .await
        .ok();
    rig.handle
        .write_address("4/0/1", Value::Bool(true), Origin::Api)
        .await
        .unwrap();
    let mut doubled = None;
    while let Ok(t) = telegrams.try_recv() {
        if t.address == "IKO:dbl:A1" && t.origin == Origin::BlockOut {
            doubled = Some(t.new_value.clone());
        }
    }
    assert_eq!(doubled, Some(Value::Real(2.0)));

    stop_rig(rig).await;
}
