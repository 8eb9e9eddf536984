use crate::{decode, CdcCredentials, SchemaCache};
use ingest_queue::Queue;
use models::{lanes, SalesforceCdcEvent, SalesforceCdcWebhookBody, SalesforceObject, SourceKind, WebhookEnvelope};
use proto_pubsub::eventbus::v1 as pubsub;
use pubsub::pub_sub_client::PubSubClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tonic::transport::Channel;

pub const PUBSUB_ENDPOINT: &str = "https://api.pubsub.salesforce.com:7443";

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
/// Events requested per FetchRequest.
const FETCH_NUM_REQUESTED: i32 = 100;
/// If no request flowed for this long, send a keepalive FetchRequest so the
/// server doesn't drop the subscription.
const REQUEST_KEEPALIVE: Duration = Duration::from_secs(90);

#[derive(Clone)]
pub struct ListenerConfig {
    pub tenant_id: String,
    pub credentials: Arc<dyn CdcCredentials>,
    pub queue: Arc<dyn Queue>,
}

/// Run the CDC listener for one tenant until `shutdown` flips true.
///
/// The listener loops through connect → probe → subscribe, reconnecting with
/// exponential backoff on failure. Backoff resets on any clean stream end.
pub async fn listener(config: ListenerConfig, mut shutdown: watch::Receiver<bool>) {
    let schema_cache = Arc::new(SchemaCache::new());
    let mut delay = INITIAL_RECONNECT_DELAY;

    tracing::info!(tenant_id = %config.tenant_id, "starting CDC listener");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let wait = match connect_and_listen(&config, &schema_cache, &shutdown).await {
            Ok(()) => {
                tracing::info!(tenant_id = %config.tenant_id, "CDC connection completed");
                delay = INITIAL_RECONNECT_DELAY;
                INITIAL_RECONNECT_DELAY
            }
            Err(err) => {
                tracing::error!(tenant_id = %config.tenant_id, ?err, "CDC connection error");
                let wait = delay;
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                wait
            }
        };

        if *shutdown.borrow() {
            break;
        }
        tracing::info!(
            tenant_id = %config.tenant_id,
            delay_secs = wait.as_secs(),
            "reconnecting CDC stream"
        );
        tokio::select! {
            () = tokio::time::sleep(wait) => (),
            _ = shutdown.changed() => (),
        }
    }

    tracing::info!(tenant_id = %config.tenant_id, "CDC listener stopped");
}

async fn connect_and_listen(
    config: &ListenerConfig,
    schema_cache: &Arc<SchemaCache>,
    shutdown: &watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let auth = config.credentials.fetch(&config.tenant_id).await?;
    let metadata = auth.metadata()?;

    tracing::info!(
        tenant_id = %config.tenant_id,
        org_id = %auth.org_id,
        "connecting to Pub/Sub API"
    );
    let channel = tonic::transport::Endpoint::from_static(PUBSUB_ENDPOINT)
        .connect()
        .await?;
    let client = PubSubClient::new(channel);

    // Probe which channels the org actually has enabled before subscribing.
    let enabled = probe_enabled_channels(&client, &metadata, &config.tenant_id).await?;
    if enabled.is_empty() {
        tracing::warn!(tenant_id = %config.tenant_id, "no CDC-enabled channels found");
        return Ok(());
    }

    let mut subscriptions = tokio::task::JoinSet::new();
    for object in enabled {
        subscriptions.spawn(subscribe_to_channel(
            client.clone(),
            metadata.clone(),
            object,
            config.clone(),
            schema_cache.clone(),
            shutdown.clone(),
        ));
    }

    // The first subscription to complete signals a connection problem (or
    // shutdown); cancel the rest and surface its result.
    let first = subscriptions.join_next().await;
    subscriptions.abort_all();
    while subscriptions.join_next().await.is_some() {}

    match first {
        Some(Ok(result)) => result,
        Some(Err(join_err)) if join_err.is_cancelled() => Ok(()),
        Some(Err(join_err)) => Err(anyhow::Error::new(join_err).context("subscription task panicked")),
        None => Ok(()),
    }
}

async fn probe_enabled_channels(
    client: &PubSubClient<Channel>,
    metadata: &tonic::metadata::MetadataMap,
    tenant_id: &str,
) -> anyhow::Result<Vec<SalesforceObject>> {
    let probes = SalesforceObject::ALL.iter().map(|&object| {
        let mut client = client.clone();
        let metadata = metadata.clone();
        async move {
            let mut request = tonic::Request::new(pubsub::TopicRequest {
                topic_name: object.change_event_topic(),
            });
            *request.metadata_mut() = metadata;

            match client.get_topic(request).await {
                Ok(response) if response.get_ref().can_subscribe => Ok(Some(object)),
                Ok(_) => {
                    tracing::warn!(%object, "CDC channel exists but is not subscribable");
                    Ok(None)
                }
                Err(status) if status.code() == tonic::Code::NotFound => {
                    tracing::warn!(%object, "CDC not enabled in Salesforce org");
                    Ok(None)
                }
                Err(status) => Err(anyhow::Error::new(status)
                    .context(format!("failed to probe CDC channel for {object}"))),
            }
        }
    });

    let mut enabled = Vec::new();
    for result in futures::future::join_all(probes).await {
        if let Some(object) = result? {
            enabled.push(object);
        }
    }
    tracing::info!(
        tenant_id,
        supported = SalesforceObject::ALL.len(),
        ?enabled,
        "probed CDC channels"
    );
    Ok(enabled)
}

fn fetch_request(topic: &str) -> pubsub::FetchRequest {
    pubsub::FetchRequest {
        topic_name: topic.to_string(),
        // Replay ids are deliberately not persisted: concurrent listener
        // replicas cover deploys, and a small event loss across full restarts
        // is accepted. LATEST keeps reconnects simple.
        replay_preset: pubsub::ReplayPreset::Latest as i32,
        replay_id: Vec::new(),
        num_requested: FETCH_NUM_REQUESTED,
    }
}

async fn subscribe_to_channel(
    mut client: PubSubClient<Channel>,
    metadata: tonic::metadata::MetadataMap,
    object: SalesforceObject,
    config: ListenerConfig,
    schema_cache: Arc<SchemaCache>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let topic = object.change_event_topic();
    tracing::info!(tenant_id = %config.tenant_id, topic, "subscribing to CDC channel");

    // Request-side queue of size one. A FetchRequest must flow for each
    // response before processing finishes, or the server stops streaming;
    // a full queue is natural backpressure.
    let (request_tx, request_rx) = mpsc::channel::<pubsub::FetchRequest>(1);
    let _ = request_tx.send(fetch_request(&topic)).await;

    let keepalive_topic = topic.clone();
    let outbound = futures::stream::unfold(request_rx, move |mut rx| {
        let topic = keepalive_topic.clone();
        async move {
            match tokio::time::timeout(REQUEST_KEEPALIVE, rx.recv()).await {
                Ok(Some(request)) => Some((request, rx)),
                Ok(None) => None,
                Err(_elapsed) => {
                    tracing::info!(topic, "request queue idle; sending keepalive");
                    Some((fetch_request(&topic), rx))
                }
            }
        }
    });

    let mut request = tonic::Request::new(outbound);
    *request.metadata_mut() = metadata.clone();
    let mut responses = client.subscribe(request).await?.into_inner();

    loop {
        let response = tokio::select! {
            response = responses.message() => response?,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!(topic, "shutdown requested; ending subscription");
                    return Ok(());
                }
                continue;
            }
        };
        let Some(response) = response else {
            tracing::info!(topic, "CDC subscription stream ended");
            return Ok(());
        };

        // Re-arm flow control immediately, before processing the batch.
        if request_tx.try_send(fetch_request(&topic)).is_err() {
            tracing::debug!(topic, "request queue already primed");
        }

        tracing::info!(
            tenant_id = %config.tenant_id,
            topic,
            events = response.events.len(),
            "received CDC events"
        );

        // Events process in parallel; a poison event is logged and skipped
        // rather than killing the stream.
        let handlers = response.events.iter().map(|consumer_event| {
            let client = client.clone();
            let metadata = metadata.clone();
            let config = &config;
            let schema_cache = &schema_cache;
            let topic = &topic;
            async move {
                if let Err(err) =
                    process_event(client, metadata, consumer_event, object, config, schema_cache)
                        .await
                {
                    tracing::error!(topic = %topic, ?err, "error processing CDC event");
                }
            }
        });
        futures::future::join_all(handlers).await;
    }
}

async fn process_event(
    mut client: PubSubClient<Channel>,
    metadata: tonic::metadata::MetadataMap,
    consumer_event: &pubsub::ConsumerEvent,
    object: SalesforceObject,
    config: &ListenerConfig,
    schema_cache: &SchemaCache,
) -> anyhow::Result<()> {
    let Some(producer_event) = &consumer_event.event else {
        return Ok(());
    };

    let schema = match schema_cache.get(&producer_event.schema_id) {
        Some(schema) => schema,
        None => {
            let mut request = tonic::Request::new(pubsub::SchemaRequest {
                schema_id: producer_event.schema_id.clone(),
            });
            *request.metadata_mut() = metadata;
            let info = client.get_schema(request).await?.into_inner();
            anyhow::ensure!(
                !info.schema_json.is_empty(),
                "empty schema returned for schema id {}",
                producer_event.schema_id
            );
            let schema = schema_cache.insert(&producer_event.schema_id, &info.schema_json)?;
            tracing::info!(schema_id = %producer_event.schema_id, "fetched and cached CDC schema");
            schema
        }
    };

    let events = decode::decode_change_events(&schema, &producer_event.payload, object)?;
    if events.is_empty() {
        tracing::warn!(%object, "CDC event carried no record ids");
        return Ok(());
    }
    send_events(config, events).await
}

async fn send_events(
    config: &ListenerConfig,
    events: Vec<SalesforceCdcEvent>,
) -> anyhow::Result<()> {
    // Lane and dedup id derive from the first event: the batch is one
    // commit for one record in practice, and dedup ids are length-capped.
    let (lane, dedup_id) = {
        let first = &events[0];
        (
            lanes::salesforce_cdc_lane(&config.tenant_id, first.object_type, &first.record_id),
            lanes::salesforce_cdc_dedup_id(&config.tenant_id, &first.batch_identifier()),
        )
    };

    let body = serde_json::to_string(&SalesforceCdcWebhookBody { events })?;
    config
        .queue
        .send_ingest_webhook(
            WebhookEnvelope {
                tenant_id: config.tenant_id.clone(),
                source_type: SourceKind::Salesforce,
                body,
                headers: Default::default(),
            },
            &lane,
            &dedup_id,
        )
        .await?;

    tracing::info!(
        tenant_id = %config.tenant_id,
        lane,
        dedup_id,
        "forwarded CDC event batch to ingest queue"
    );
    Ok(())
}
