//! Integration tests against the `substrate-mock` plugin process

use serde_json::json;
use substrate_common::{
    options::{flatten_options, with_params, with_timestamp_generator},
    ConnectConfig, Error, SubstrateConnection,
};

fn config() -> ConnectConfig {
    let mut config = ConnectConfig::with_command(env!("CARGO_BIN_EXE_substrate-mock"));
    config.log_level = "warn".to_string();
    config
}

#[tokio::test]
async fn test_plugin_round_trip() {
    let connection = SubstrateConnection::connect(&config()).await.unwrap();
    let substrate = connection.substrate();

    assert_eq!(substrate.health_check(5).await.unwrap(), 5);

    let tag = substrate.new_session().await.unwrap();
    let put = flatten_options(&[
        with_params(json!(["greeting", "hello"])),
        with_timestamp_generator(|_| "2024-01-01T00:00:00Z".to_string()),
    ])
    .unwrap();
    let response = substrate.call(&tag, "put", &put).await.unwrap();
    assert!(!response.has_error);
    assert_eq!(response.transaction(), Some("tx-1"));

    let get = flatten_options(&[with_params(json!(["greeting"]))]).unwrap();
    let response = substrate.call(&tag, "get", &get).await.unwrap();
    assert_eq!(response.unmarshal_to::<String>().unwrap(), "hello");

    let height = substrate.query_info(&tag, &get).await.unwrap();
    assert_eq!(height, 1);
    let block = substrate.query_block(&tag, 0, &get).await.unwrap();
    assert_eq!(block.transactions[0].id, "tx-1");

    substrate.close_session(&tag).await.unwrap();
    drop(substrate);
    connection.close().await.unwrap();
}

#[tokio::test]
async fn test_plugin_application_error_crosses_boundary() {
    let result = SubstrateConnection::connect_with(&config(), |substrate| async move {
        let err = substrate
            .snapshot_simulated("no-such-session")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Application(_)));
        assert!(!substrate.is_timeout_error(&err));
        Ok(())
    })
    .await;
    result.unwrap();
}

#[tokio::test]
async fn test_missing_plugin_is_transport_error() {
    let config = ConnectConfig::with_command("/nonexistent/substrate-plugin");
    let err = SubstrateConnection::connect(&config).await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_plugin_refuses_without_cookie() {
    let output = tokio::process::Command::new(env!("CARGO_BIN_EXE_substrate-mock"))
        .env_remove("SUBSTRATEHCP1")
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}
