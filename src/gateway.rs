//! Assemble pipelines and gates from a multi-document YAML config.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::gate::{GateState, HttpServer, TcpServer, UdpServer};
use crate::mqtt::MqttProxy;
use crate::pipeline::Pipeline;
use crate::registry::{FilterRegistry, PipelineMap};
use crate::spec::{
    self, load_objects, HttpServerSpec, MqttProxySpec, PipelineSpec, RawObject, TcpServerSpec,
    UdpServerSpec,
};
use crate::store::Storage;

/// A running set of gateway objects built from one config generation.
pub struct Gateway {
    pipelines: PipelineMap,
    http: Vec<HttpServer>,
    tcp: Vec<TcpServer>,
    udp: Vec<UdpServer>,
    mqtt: Vec<MqttProxy>,
    storage: Arc<dyn Storage>,
}

/// Per-kind object counts, for `validate-config` output.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConfigSummary {
    pub pipelines: usize,
    pub http_servers: usize,
    pub tcp_servers: usize,
    pub udp_servers: usize,
    pub mqtt_proxies: usize,
}

impl Gateway {
    /// Build and start every object in the config. Pipelines come up before
    /// the gates that route into them.
    pub async fn from_yaml(input: &str, storage: Arc<dyn Storage>) -> Result<Gateway> {
        let objects = load_objects(input)?;
        check_unique_names(&objects)?;

        let registry = FilterRegistry::global();
        let pipelines = PipelineMap::new();
        for object in objects.iter().filter(|o| o.kind == spec::KIND_PIPELINE) {
            let pipeline_spec: PipelineSpec = object.decode()?;
            let pipeline = Pipeline::new(&pipeline_spec, registry)?;
            pipelines.set(object.name.clone(), Arc::new(pipeline));
        }

        let mut gateway = Gateway {
            pipelines,
            http: Vec::new(),
            tcp: Vec::new(),
            udp: Vec::new(),
            mqtt: Vec::new(),
            storage,
        };

        for object in &objects {
            match object.kind.as_str() {
                spec::KIND_PIPELINE => {}
                spec::KIND_HTTP_SERVER => {
                    let gate_spec: HttpServerSpec = object.decode()?;
                    gateway
                        .http
                        .push(HttpServer::new(gate_spec, gateway.pipelines.clone())?);
                }
                spec::KIND_TCP_SERVER => {
                    let gate_spec: TcpServerSpec = object.decode()?;
                    gateway.tcp.push(TcpServer::new(gate_spec)?);
                }
                spec::KIND_UDP_SERVER => {
                    let gate_spec: UdpServerSpec = object.decode()?;
                    gateway.udp.push(UdpServer::new(gate_spec)?);
                }
                spec::KIND_MQTT_PROXY => {
                    let gate_spec: MqttProxySpec = object.decode()?;
                    gateway
                        .mqtt
                        .push(MqttProxy::new(gate_spec, gateway.storage.clone()).await?);
                }
                other => {
                    return Err(Error::spec(format!("unknown object kind {:?}", other)));
                }
            }
        }
        Ok(gateway)
    }

    /// Validate a config without binding listeners: every spec is decoded
    /// and checked, pipelines are fully constructed then torn down.
    pub fn validate(input: &str) -> Result<ConfigSummary> {
        let objects = load_objects(input)?;
        check_unique_names(&objects)?;

        let registry = FilterRegistry::global();
        let mut summary = ConfigSummary::default();
        for object in &objects {
            match object.kind.as_str() {
                spec::KIND_PIPELINE => {
                    let pipeline_spec: PipelineSpec = object.decode()?;
                    let pipeline = Pipeline::new(&pipeline_spec, registry)?;
                    pipeline.close();
                    summary.pipelines += 1;
                }
                spec::KIND_HTTP_SERVER => {
                    object.decode::<HttpServerSpec>()?.validate()?;
                    summary.http_servers += 1;
                }
                spec::KIND_TCP_SERVER => {
                    object.decode::<TcpServerSpec>()?.validate()?;
                    summary.tcp_servers += 1;
                }
                spec::KIND_UDP_SERVER => {
                    object.decode::<UdpServerSpec>()?.validate()?;
                    summary.udp_servers += 1;
                }
                spec::KIND_MQTT_PROXY => {
                    object.decode::<MqttProxySpec>()?.validate()?;
                    summary.mqtt_proxies += 1;
                }
                other => {
                    return Err(Error::spec(format!("unknown object kind {:?}", other)));
                }
            }
        }
        Ok(summary)
    }

    /// Apply a new config generation: pipelines inherit from their
    /// predecessors, gates reload in place.
    pub async fn reload_from_yaml(&mut self, input: &str) -> Result<()> {
        let objects = load_objects(input)?;
        check_unique_names(&objects)?;
        let registry = FilterRegistry::global();

        for object in objects.iter().filter(|o| o.kind == spec::KIND_PIPELINE) {
            let pipeline_spec: PipelineSpec = object.decode()?;
            let next = match self.pipelines.get(&object.name) {
                Some(previous) => {
                    let next = Pipeline::inherit(&pipeline_spec, &previous, registry)?;
                    Arc::new(next)
                }
                None => Arc::new(Pipeline::new(&pipeline_spec, registry)?),
            };
            if let Some(old) = self.pipelines.set(object.name.clone(), next) {
                // In-flight requests hold their own reference to the old
                // generation; closing only stops its background work.
                old.close();
            }
        }

        for object in &objects {
            match object.kind.as_str() {
                spec::KIND_HTTP_SERVER => {
                    let gate_spec: HttpServerSpec = object.decode()?;
                    match self.http.iter().position(|g| g.name() == object.name) {
                        Some(i) => self.http[i].reload(gate_spec)?,
                        None => self
                            .http
                            .push(HttpServer::new(gate_spec, self.pipelines.clone())?),
                    }
                }
                spec::KIND_TCP_SERVER => {
                    let gate_spec: TcpServerSpec = object.decode()?;
                    match self.tcp.iter().position(|g| g.name() == object.name) {
                        Some(i) => self.tcp[i].reload(gate_spec)?,
                        None => self.tcp.push(TcpServer::new(gate_spec)?),
                    }
                }
                spec::KIND_UDP_SERVER => {
                    let gate_spec: UdpServerSpec = object.decode()?;
                    match self.udp.iter().position(|g| g.name() == object.name) {
                        Some(i) => self.udp[i].reload(gate_spec)?,
                        None => self.udp.push(UdpServer::new(gate_spec)?),
                    }
                }
                spec::KIND_MQTT_PROXY => {
                    let gate_spec: MqttProxySpec = object.decode()?;
                    match self.mqtt.iter().position(|g| g.name() == object.name) {
                        Some(i) => self.mqtt[i].reload(&gate_spec)?,
                        None => self
                            .mqtt
                            .push(MqttProxy::new(gate_spec, self.storage.clone()).await?),
                    }
                }
                spec::KIND_PIPELINE => {}
                other => {
                    return Err(Error::spec(format!("unknown object kind {:?}", other)));
                }
            }
        }
        Ok(())
    }

    pub fn pipelines(&self) -> &PipelineMap {
        &self.pipelines
    }

    pub fn http_gates(&self) -> &[HttpServer] {
        &self.http
    }

    pub fn tcp_gates(&self) -> &[TcpServer] {
        &self.tcp
    }

    pub fn udp_gates(&self) -> &[UdpServer] {
        &self.udp
    }

    pub fn mqtt_gates(&self) -> &[MqttProxy] {
        &self.mqtt
    }

    /// Whether every listener-backed gate reached `Running`.
    pub async fn wait_running(&self, timeout: std::time::Duration) -> Result<()> {
        for gate in &self.http {
            gate.wait_for(GateState::Running, timeout).await?;
        }
        for gate in &self.tcp {
            gate.wait_for(GateState::Running, timeout).await?;
        }
        for gate in &self.udp {
            gate.wait_for(GateState::Running, timeout).await?;
        }
        Ok(())
    }

    /// Gracefully close every gate, then the pipelines.
    pub async fn close(&self) {
        for gate in &self.http {
            gate.close().await;
        }
        for gate in &self.tcp {
            gate.close().await;
        }
        for gate in &self.udp {
            gate.close().await;
        }
        for gate in &self.mqtt {
            gate.close().await;
        }
        for name in self.pipelines.names() {
            if let Some(pipeline) = self.pipelines.remove(&name) {
                pipeline.close();
            }
        }
    }
}

fn check_unique_names(objects: &[RawObject]) -> Result<()> {
    let mut seen: HashMap<(&str, &str), ()> = HashMap::new();
    for object in objects {
        if seen
            .insert((object.kind.as_str(), object.name.as_str()), ())
            .is_some()
        {
            return Err(Error::spec(format!(
                "duplicate {} object named {:?}",
                object.kind, object.name
            )));
        }
    }
    Ok(())
}
