//! The stacks of the application environment.
//!
//! Stacks never hold references to each other. Anything one stack needs from
//! another travels through an export, and the consumer declares a dependency
//! on the producer when the environment is assembled.

use stackline_core::{import_value, ParameterDecl, Stack, StackKind};

use crate::config::EnvironmentConfig;
use crate::error::EnvResult;
use crate::resources::{
    ClusterSpec, DatabaseSpec, KeyAttribute, QueueSpec, QueueSubscriptionSpec, RemovalPolicy,
    ResourceSpec, ServiceSpec, TableSpec, TopicSpec, VpcSpec,
};

pub const VPC: &str = "Vpc";
pub const CLUSTER: &str = "Cluster";
pub const RDS: &str = "Rds";
pub const SNS: &str = "Sns";
pub const SERVICE01: &str = "Service01";
pub const DDB: &str = "Ddb";
pub const SERVICE02: &str = "Service02";

/// Export names.
pub mod exports {
    pub const VPC_ID: &str = "vpc-id";
    pub const CLUSTER_NAME: &str = "cluster-name";
    pub const RDS_ENDPOINT: &str = "rds-endpoint";
    pub const RDS_PASSWORD: &str = "rds-password";
    pub const TOPIC_ARN: &str = "product-events-topic-arn";
    pub const TABLE_NAME: &str = "product-events-table";
}

/// Logical ids of resources that scaling policies are bound to.
pub const SERVICE01_LB: &str = "ALB01";
pub const SERVICE02_LB: &str = "ALB02";
pub const EVENTS_TABLE: &str = "ProductEventsDdb";

pub const DATABASE_PASSWORD: &str = "databasePassword";

pub fn vpc() -> EnvResult<Stack> {
    let vpc = VpcSpec::new("Vpc01").declare()?;
    Ok(Stack::new(VPC, StackKind::Network)
        .with_description("Network with public subnets and no NAT gateways")
        .export_output(exports::VPC_ID, vpc.attribute("Id"))?
        .resource(vpc))
}

pub fn cluster() -> EnvResult<Stack> {
    let cluster = ClusterSpec {
        logical_id: "Cluster01".to_string(),
        cluster_name: "cluster-01".to_string(),
        vpc_id: import_value(exports::VPC_ID),
    }
    .declare()?;

    Ok(Stack::new(CLUSTER, StackKind::Cluster)
        .with_description("Container cluster")
        .import(exports::VPC_ID)
        .export_output(exports::CLUSTER_NAME, cluster.attribute("Name"))?
        .resource(cluster))
}

pub fn rds(config: &EnvironmentConfig) -> EnvResult<Stack> {
    let database = DatabaseSpec::mysql(
        "Rds01",
        format!("{}-db", config.name),
        import_value(exports::VPC_ID),
    )
    .declare()?;

    Ok(Stack::new(RDS, StackKind::Database)
        .with_description("MySQL database")
        .parameter(ParameterDecl::new(DATABASE_PASSWORD, "The RDS instance password").no_echo())
        .import(exports::VPC_ID)
        .export_output(exports::RDS_ENDPOINT, database.attribute("Endpoint"))?
        .export_parameter(exports::RDS_PASSWORD, DATABASE_PASSWORD)?
        .resource(database))
}

pub fn sns(config: &EnvironmentConfig) -> EnvResult<Stack> {
    let mut topic = TopicSpec::new("ProductEventsTopic");
    if let Some(email) = &config.topic_email {
        topic = topic.email_subscriber(email);
    }
    let topic = topic.declare()?;

    Ok(Stack::new(SNS, StackKind::Messaging)
        .with_description("Product events topic")
        .export_output(exports::TOPIC_ARN, topic.attribute("Arn"))?
        .resource(topic))
}

pub fn ddb() -> EnvResult<Stack> {
    let table = TableSpec {
        logical_id: EVENTS_TABLE.to_string(),
        table_name: "product-events".to_string(),
        read_capacity: 1,
        write_capacity: 1,
        partition_key: KeyAttribute::string("pk"),
        sort_key: Some(KeyAttribute::string("sk")),
        ttl_attribute: Some("ttl".to_string()),
        removal_policy: RemovalPolicy::Destroy,
    }
    .declare()?;

    Ok(Stack::new(DDB, StackKind::Table)
        .with_description("Product events table")
        .export_output(exports::TABLE_NAME, table.attribute("Name"))?
        .resource(table))
}

pub fn service01(config: &EnvironmentConfig) -> EnvResult<Stack> {
    let topic_arn = import_value(exports::TOPIC_ARN);
    let service = ServiceSpec::new(
        SERVICE01_LB,
        "service-01",
        import_value(exports::CLUSTER_NAME),
        "aws_project01",
        &config.images.service01,
        8080,
        "Service01",
    )
    .env(
        "SPRING_DATASOURCE_URL",
        format!(
            "jdbc:mariadb://{}:3306/aws_project01?createDatabaseIfNotExist=true",
            import_value(exports::RDS_ENDPOINT)
        ),
    )
    .env("SPRING_DATASOURCE_USERNAME", "admin")
    .env("SPRING_DATASOURCE_PASSWORD", import_value(exports::RDS_PASSWORD))
    .env("AWS_REGION", &config.region)
    .env("AWS_SNS_TOPIC_PRODUCT_EVENTS_ARN", &topic_arn)
    .grant("sns:Publish", topic_arn);

    Ok(Stack::new(SERVICE01, StackKind::Service)
        .with_description("Product service")
        .import(exports::CLUSTER_NAME)
        .import(exports::RDS_ENDPOINT)
        .import(exports::RDS_PASSWORD)
        .import(exports::TOPIC_ARN)
        .resource(service.declare()?))
}

pub fn service02(config: &EnvironmentConfig) -> EnvResult<Stack> {
    let dlq = QueueSpec::new("ProductEventsDlq", "product-events-dlq");
    let queue = QueueSpec::new("ProductEvents", "product-events").with_dead_letter(&dlq.logical_id, 3);
    let subscription = QueueSubscriptionSpec {
        logical_id: "ProductEventsSubscription".to_string(),
        topic_arn: import_value(exports::TOPIC_ARN),
        queue: queue.logical_id.clone(),
    };

    let service = ServiceSpec::new(
        SERVICE02_LB,
        "service-02",
        import_value(exports::CLUSTER_NAME),
        "aws_project02",
        &config.images.service02,
        9090,
        "Service02",
    )
    .env("AWS_REGION", &config.region)
    .env("AWS_SQS_QUEUE_PRODUCT_EVENTS_NAME", &queue.queue_name)
    .grant("sqs:ConsumeMessages", &queue.logical_id)
    .grant("dynamodb:ReadWriteData", import_value(exports::TABLE_NAME));

    Ok(Stack::new(SERVICE02, StackKind::Service)
        .with_description("Product events consumer")
        .import(exports::CLUSTER_NAME)
        .import(exports::TOPIC_ARN)
        .import(exports::TABLE_NAME)
        .resource(dlq.declare()?)
        .resource(queue.declare()?)
        .resource(subscription.declare()?)
        .resource(service.declare()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rds_exports() {
        let stack = rds(&EnvironmentConfig::default()).unwrap();
        let endpoint = stack.find_export(exports::RDS_ENDPOINT).unwrap();
        assert!(!endpoint.sensitive);

        let password = stack.find_export(exports::RDS_PASSWORD).unwrap();
        assert!(password.sensitive);
        assert!(stack.find_parameter(DATABASE_PASSWORD).unwrap().is_required());
        assert_eq!(stack.resources[0].properties["instanceIdentifier"], "aws-project01-db");
    }

    #[test]
    fn test_service01_env_uses_import_tokens() {
        let stack = service01(&EnvironmentConfig::default()).unwrap();
        let env = &stack.resources[0].properties["container"]["environment"];
        assert_eq!(
            env["SPRING_DATASOURCE_URL"],
            "jdbc:mariadb://${Import:rds-endpoint}:3306/aws_project01?createDatabaseIfNotExist=true"
        );
        assert_eq!(env["SPRING_DATASOURCE_PASSWORD"], "${Import:rds-password}");
        assert_eq!(stack.imports.len(), 4);
    }

    #[test]
    fn test_service02_queue_wiring() {
        let stack = service02(&EnvironmentConfig::default()).unwrap();
        let kinds: Vec<_> = stack.resources.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["sqs-queue", "sqs-queue", "topic-subscription", "load-balanced-service"]
        );
        assert_eq!(stack.resources[1].properties["deadLetter"]["queue"], "ProductEventsDlq");
        assert_eq!(stack.resources[3].properties["listenerPort"], 9090);
    }

    #[test]
    fn test_sns_without_email() {
        let config = EnvironmentConfig {
            topic_email: None,
            ..EnvironmentConfig::default()
        };
        let stack = sns(&config).unwrap();
        assert_eq!(stack.resources[0].properties["subscriptions"], serde_json::json!([]));
    }
}
