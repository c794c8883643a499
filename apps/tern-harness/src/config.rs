use config::{Config, ConfigError, Environment, File};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tern_sim::{random_batch_sizes, Scenario, ScenarioSettings};
use tern_subscriber::{FlowControlConfig, SubscriberConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct HarnessConfig {
    #[serde(with = "humantime_serde")]
    pub time_unit: Duration,
    pub timeout_units: u32,
    pub publish_count: usize,
    pub subscribe_count: usize,
    #[serde(deserialize_with = "deserialize_list")]
    pub batch_sizes: Vec<usize>,
    pub batch_seed: Option<u64>,
    pub max_messages: usize,
    pub max_bytes: Option<usize>,
    pub max_workers: usize,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub thread_name: String,
    #[serde(deserialize_with = "deserialize_list")]
    pub scenarios: Vec<Scenario>,
}

fn deserialize_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: fmt::Display,
{
    struct ListVisitor<T>(PhantomData<T>);

    impl<'de, T> Visitor<'de> for ListVisitor<T>
    where
        T: FromStr + Deserialize<'de>,
        T::Err: fmt::Display,
    {
        type Value = Vec<T>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            value
                .split(|c| c == ',' || c == ';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.parse::<T>().map_err(E::custom))
                .collect()
        }

        // Single numeric env values arrive pre-parsed.
        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&value.to_string())
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&value.to_string())
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor(PhantomData))
}

impl HarnessConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("time_unit", "50ms")?
            .set_default("timeout_units", 60)?
            .set_default("publish_count", 500)?
            .set_default("subscribe_count", 50)?
            .set_default("batch_sizes", "7,4,8,2,10,1,3,8,6,1")?
            .set_default("batch_seed", None::<String>)?
            .set_default("max_messages", 5)?
            .set_default("max_bytes", None::<String>)?
            .set_default("max_workers", 10)?
            .set_default("poll_interval", "10ms")?
            .set_default("thread_name", "tern-harness")?
            .set_default(
                "scenarios",
                "publish,subscribe,async-callbacks,max-messages,callback-error",
            )?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // Loaded into the process environment so the prefixed
                // Environment source below picks the values up.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("TERN_HARNESS").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    /// Batch shape for the max-messages scenario. A seed reshuffles the
    /// configured total into random batches.
    pub fn effective_batch_sizes(&self) -> Vec<usize> {
        match self.batch_seed {
            Some(seed) => {
                let total = self.batch_sizes.iter().sum();
                let widest = self.batch_sizes.iter().copied().max().unwrap_or(1);
                random_batch_sizes(seed, total, widest)
            }
            None => self.batch_sizes.clone(),
        }
    }

    pub fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig {
            flow_control: FlowControlConfig {
                max_bytes: self.max_bytes,
                ..FlowControlConfig::default()
            },
            max_workers: self.max_workers,
            poll_interval: self.poll_interval,
            thread_name: self.thread_name.clone(),
        }
    }

    pub fn scenario_settings(&self) -> ScenarioSettings {
        ScenarioSettings {
            time_unit: self.time_unit,
            timeout_units: self.timeout_units,
            publish_count: self.publish_count,
            subscribe_count: self.subscribe_count,
            batch_sizes: self.effective_batch_sizes(),
            max_messages: self.max_messages,
            subscriber: self.subscriber_config(),
        }
    }
}
