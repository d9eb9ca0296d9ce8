use paho_mqtt as mqtt;
use uuid::Uuid;

/// Builds the `paho-mqtt` client creation options for a fresh broker
/// connection, generating a random client id per §4.2's "Connects to
/// broker" step.
pub fn mqtt_create_opts(server_uri: &str) -> mqtt::CreateOptions {
    let client_id = Uuid::new_v4().to_string();
    tracing::debug!(server_uri, client_id, "creating mqtt client");
    mqtt::CreateOptionsBuilder::new()
        .server_uri(server_uri)
        .client_id(&client_id)
        .finalize()
}

pub async fn mqtt_publish(
    mqtt_cli: &mqtt::AsyncClient,
    topic: &str,
    payload: Vec<u8>,
    qos: i32,
    retained: bool,
) -> mqtt::Result<()> {
    let msg = mqtt::MessageBuilder::new()
        .topic(topic)
        .payload(payload)
        .qos(qos)
        .retained(retained)
        .finalize();
    mqtt_cli.publish(msg).await?;
    Ok(())
}
