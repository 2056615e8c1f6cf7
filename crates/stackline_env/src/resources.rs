//! Typed resource declarations.
//!
//! Each spec serializes (camelCase) into the properties of a
//! [`ResourceDecl`]. String properties may carry import tokens made with
//! [`stackline_core::import_value`]; the backend substitutes them once the
//! imports are resolved.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use stackline_core::ResourceDecl;

use crate::error::{EnvError, EnvResult};

/// A typed resource that can be declared in a stack.
pub trait ResourceSpec: Serialize {
    /// Resource type understood by backends.
    const KIND: &'static str;

    fn logical_id(&self) -> &str;

    /// Check the declaration before it enters a stack.
    fn validate(&self) -> EnvResult<()> {
        Ok(())
    }

    /// Validate and convert into an untyped declaration.
    fn declare(&self) -> EnvResult<ResourceDecl> {
        self.validate()?;
        Ok(ResourceDecl::new(
            self.logical_id(),
            Self::KIND,
            serde_json::to_value(self)?,
        ))
    }
}

fn invalid(logical_id: &str, reason: impl Into<String>) -> EnvError {
    EnvError::InvalidResource {
        logical_id: logical_id.to_string(),
        reason: reason.into(),
    }
}

/// What happens to a resource's data when its stack is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    #[default]
    Destroy,
    Retain,
}

/// Network with public subnets spread over availability zones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcSpec {
    #[serde(skip)]
    pub logical_id: String,
    pub max_azs: u8,
    /// Zero means services get public IPs instead of NAT egress.
    pub nat_gateways: u8,
}

impl VpcSpec {
    pub fn new(logical_id: impl Into<String>) -> Self {
        Self {
            logical_id: logical_id.into(),
            max_azs: 3,
            nat_gateways: 0,
        }
    }
}

impl ResourceSpec for VpcSpec {
    const KIND: &'static str = "vpc";

    fn logical_id(&self) -> &str {
        &self.logical_id
    }

    fn validate(&self) -> EnvResult<()> {
        if self.max_azs == 0 {
            return Err(invalid(&self.logical_id, "maxAzs must be at least 1"));
        }
        Ok(())
    }
}

/// Container cluster placed in a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(skip)]
    pub logical_id: String,
    pub cluster_name: String,
    pub vpc_id: String,
}

impl ResourceSpec for ClusterSpec {
    const KIND: &'static str = "ecs-cluster";

    fn logical_id(&self) -> &str {
        &self.logical_id
    }
}

/// Relational database instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    #[serde(skip)]
    pub logical_id: String,
    pub instance_identifier: String,
    pub engine: String,
    pub engine_version: String,
    pub instance_class: String,
    pub allocated_storage_gb: u32,
    pub multi_az: bool,
    pub username: String,
    /// Name of the stack parameter holding the admin password.
    pub password_parameter: String,
    pub port: u16,
    /// CIDR allowed to reach `port`.
    pub ingress_cidr: String,
    pub public_subnets: bool,
    pub vpc_id: String,
}

impl DatabaseSpec {
    /// MySQL 5.7 on a burstable micro instance with 10 GB of storage.
    pub fn mysql(
        logical_id: impl Into<String>,
        instance_identifier: impl Into<String>,
        vpc_id: impl Into<String>,
    ) -> Self {
        Self {
            logical_id: logical_id.into(),
            instance_identifier: instance_identifier.into(),
            engine: "mysql".to_string(),
            engine_version: "5.7".to_string(),
            instance_class: "t2.micro".to_string(),
            allocated_storage_gb: 10,
            multi_az: false,
            username: "admin".to_string(),
            password_parameter: "databasePassword".to_string(),
            port: 3306,
            ingress_cidr: "0.0.0.0/0".to_string(),
            public_subnets: true,
            vpc_id: vpc_id.into(),
        }
    }
}

impl ResourceSpec for DatabaseSpec {
    const KIND: &'static str = "database-instance";

    fn logical_id(&self) -> &str {
        &self.logical_id
    }

    fn validate(&self) -> EnvResult<()> {
        if self.allocated_storage_gb == 0 {
            return Err(invalid(&self.logical_id, "allocated storage must be positive"));
        }
        if self.instance_identifier.is_empty() {
            return Err(invalid(&self.logical_id, "instance identifier is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionProtocol {
    Email,
    Sqs,
}

/// A topic subscription declared with the topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub protocol: SubscriptionProtocol,
    pub endpoint: String,
    /// Deliver the full JSON envelope rather than the raw message.
    #[serde(default)]
    pub json: bool,
}

/// Messaging topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSpec {
    #[serde(skip)]
    pub logical_id: String,
    pub subscriptions: Vec<Subscription>,
}

impl TopicSpec {
    pub fn new(logical_id: impl Into<String>) -> Self {
        Self {
            logical_id: logical_id.into(),
            subscriptions: Vec::new(),
        }
    }

    pub fn email_subscriber(mut self, address: impl Into<String>) -> Self {
        self.subscriptions.push(Subscription {
            protocol: SubscriptionProtocol::Email,
            endpoint: address.into(),
            json: true,
        });
        self
    }
}

impl ResourceSpec for TopicSpec {
    const KIND: &'static str = "sns-topic";

    fn logical_id(&self) -> &str {
        &self.logical_id
    }

    fn validate(&self) -> EnvResult<()> {
        for sub in &self.subscriptions {
            if sub.protocol == SubscriptionProtocol::Email && !sub.endpoint.contains('@') {
                return Err(invalid(
                    &self.logical_id,
                    format!("'{}' is not an email address", sub.endpoint),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    String,
    Number,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAttribute {
    pub name: String,
    #[serde(rename = "type")]
    pub attribute_type: AttributeType,
}

impl KeyAttribute {
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attribute_type: AttributeType::String,
        }
    }
}

/// NoSQL table with provisioned capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSpec {
    #[serde(skip)]
    pub logical_id: String,
    pub table_name: String,
    pub read_capacity: u32,
    pub write_capacity: u32,
    pub partition_key: KeyAttribute,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_key: Option<KeyAttribute>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_attribute: Option<String>,
    pub removal_policy: RemovalPolicy,
}

impl ResourceSpec for TableSpec {
    const KIND: &'static str = "dynamodb-table";

    fn logical_id(&self) -> &str {
        &self.logical_id
    }

    fn validate(&self) -> EnvResult<()> {
        if self.read_capacity == 0 || self.write_capacity == 0 {
            return Err(invalid(&self.logical_id, "provisioned capacity must be positive"));
        }
        if self.sort_key.as_ref().is_some_and(|k| k.name == self.partition_key.name) {
            return Err(invalid(&self.logical_id, "sort key repeats the partition key"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Logical id of the dead-letter queue in the same stack.
    pub queue: String,
    pub max_receive_count: u32,
}

/// Message queue, optionally with a dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSpec {
    #[serde(skip)]
    pub logical_id: String,
    pub queue_name: String,
    pub encrypted: bool,
    pub enforce_ssl: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<DeadLetter>,
}

impl QueueSpec {
    pub fn new(logical_id: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            logical_id: logical_id.into(),
            queue_name: queue_name.into(),
            encrypted: false,
            enforce_ssl: false,
            dead_letter: None,
        }
    }

    pub fn with_dead_letter(mut self, queue: impl Into<String>, max_receive_count: u32) -> Self {
        self.dead_letter = Some(DeadLetter {
            queue: queue.into(),
            max_receive_count,
        });
        self
    }
}

impl ResourceSpec for QueueSpec {
    const KIND: &'static str = "sqs-queue";

    fn logical_id(&self) -> &str {
        &self.logical_id
    }

    fn validate(&self) -> EnvResult<()> {
        match &self.dead_letter {
            Some(dl) if dl.max_receive_count == 0 => {
                Err(invalid(&self.logical_id, "maxReceiveCount must be at least 1"))
            }
            Some(dl) if dl.queue == self.logical_id => {
                Err(invalid(&self.logical_id, "a queue cannot be its own dead-letter queue"))
            }
            _ => Ok(()),
        }
    }
}

/// Subscribes a queue in this stack to a topic from another stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSubscriptionSpec {
    #[serde(skip)]
    pub logical_id: String,
    pub topic_arn: String,
    pub queue: String,
}

impl ResourceSpec for QueueSubscriptionSpec {
    const KIND: &'static str = "topic-subscription";

    fn logical_id(&self) -> &str {
        &self.logical_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub path: String,
    pub port: u16,
    pub healthy_http_codes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogGroup {
    pub log_group_name: String,
    pub stream_prefix: String,
    pub removal_policy: RemovalPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub container_name: String,
    pub image: String,
    pub container_port: u16,
    pub environment: BTreeMap<String, String>,
}

/// Permission granted to the service's task role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub action: String,
    /// Resource the grant applies to; may be an import token.
    pub target: String,
}

/// Container service behind a public load balancer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(skip)]
    pub logical_id: String,
    pub service_name: String,
    pub cluster: String,
    pub cpu: u32,
    pub memory_limit_mib: u32,
    pub desired_count: u32,
    pub listener_port: u16,
    pub assign_public_ip: bool,
    pub public_load_balancer: bool,
    pub container: ContainerSpec,
    pub log_group: LogGroup,
    pub health_check: HealthCheck,
    #[serde(default)]
    pub grants: Vec<Grant>,
}

impl ServiceSpec {
    /// A 512 CPU / 1024 MiB service with two tasks, listening on `port`
    /// and logging to a group named after `log_name`.
    pub fn new(
        logical_id: impl Into<String>,
        service_name: impl Into<String>,
        cluster: impl Into<String>,
        container_name: impl Into<String>,
        image: impl Into<String>,
        port: u16,
        log_name: &str,
    ) -> Self {
        Self {
            logical_id: logical_id.into(),
            service_name: service_name.into(),
            cluster: cluster.into(),
            cpu: 512,
            memory_limit_mib: 1024,
            desired_count: 2,
            listener_port: port,
            assign_public_ip: true,
            public_load_balancer: true,
            container: ContainerSpec {
                container_name: container_name.into(),
                image: image.into(),
                container_port: port,
                environment: BTreeMap::new(),
            },
            log_group: LogGroup {
                log_group_name: log_name.to_string(),
                stream_prefix: log_name.to_string(),
                removal_policy: RemovalPolicy::Destroy,
            },
            health_check: HealthCheck {
                path: "/actuator/health".to_string(),
                port,
                healthy_http_codes: "200".to_string(),
            },
            grants: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.container.environment.insert(key.into(), value.into());
        self
    }

    pub fn grant(mut self, action: impl Into<String>, target: impl Into<String>) -> Self {
        self.grants.push(Grant {
            action: action.into(),
            target: target.into(),
        });
        self
    }
}

impl ResourceSpec for ServiceSpec {
    const KIND: &'static str = "load-balanced-service";

    fn logical_id(&self) -> &str {
        &self.logical_id
    }

    fn validate(&self) -> EnvResult<()> {
        if self.cpu == 0 || self.memory_limit_mib == 0 {
            return Err(invalid(&self.logical_id, "cpu and memory must be positive"));
        }
        if self.desired_count == 0 {
            return Err(invalid(&self.logical_id, "desired count must be at least 1"));
        }
        if !self.health_check.path.starts_with('/') {
            return Err(invalid(
                &self.logical_id,
                format!("health check path '{}' must start with '/'", self.health_check.path),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackline_core::import_value;

    #[test]
    fn test_service_declaration() {
        let decl = ServiceSpec::new(
            "ALB01",
            "service-01",
            import_value("cluster-name"),
            "aws_project01",
            "name_image_docker",
            8080,
            "Service01",
        )
        .env("AWS_REGION", "us-east-1")
        .declare()
        .unwrap();

        assert_eq!(decl.logical_id, "ALB01");
        assert_eq!(decl.kind, "load-balanced-service");
        assert_eq!(decl.properties["cluster"], "${Import:cluster-name}");
        assert_eq!(decl.properties["healthCheck"]["path"], "/actuator/health");
        assert_eq!(decl.properties["container"]["environment"]["AWS_REGION"], "us-east-1");
        assert!(decl.properties.get("logicalId").is_none());
    }

    #[test]
    fn test_service_validation() {
        let mut spec = ServiceSpec::new("ALB01", "s", "c", "n", "i", 8080, "Log");
        spec.desired_count = 0;
        assert!(matches!(spec.declare(), Err(EnvError::InvalidResource { .. })));

        let mut spec = ServiceSpec::new("ALB01", "s", "c", "n", "i", 8080, "Log");
        spec.health_check.path = "health".to_string();
        assert!(spec.declare().is_err());
    }

    #[test]
    fn test_table_validation() {
        let table = TableSpec {
            logical_id: "T".to_string(),
            table_name: "t".to_string(),
            read_capacity: 1,
            write_capacity: 1,
            partition_key: KeyAttribute::string("pk"),
            sort_key: Some(KeyAttribute::string("pk")),
            ttl_attribute: None,
            removal_policy: RemovalPolicy::Destroy,
        };
        assert!(table.declare().is_err());
    }

    #[test]
    fn test_queue_dead_letter() {
        let queue = QueueSpec::new("ProductEvents", "product-events").with_dead_letter("ProductEventsDlq", 3);
        let decl = queue.declare().unwrap();
        assert_eq!(decl.properties["deadLetter"]["maxReceiveCount"], 3);

        let bad = QueueSpec::new("Q", "q").with_dead_letter("Q", 3);
        assert!(bad.declare().is_err());
    }

    #[test]
    fn test_topic_email_subscription() {
        let topic = TopicSpec::new("ProductEventsTopic").email_subscriber("teste@teste.com");
        let decl = topic.declare().unwrap();
        assert_eq!(decl.properties["subscriptions"][0]["protocol"], "email");
        assert_eq!(decl.properties["subscriptions"][0]["json"], true);

        assert!(TopicSpec::new("T").email_subscriber("nobody").declare().is_err());
    }
}
