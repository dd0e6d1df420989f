use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use courier_common::internal;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::{fs, io::AsyncWriteExt, sync::Notify};

use crate::{
    error::{BrokerError, EnqueueError, ValidationError},
    r#trait::BrokerTransport,
    types::{AckHandle, Delivery, Destination, EnqueueOptions, Envelope, MessageId, Topology, now_ms},
};

const READY_SUFFIX: &str = ".msg";
const INFLIGHT_SUFFIX: &str = ".inflight";
const CORRUPT_SUFFIX: &str = ".corrupt";
const TEMP_PREFIX: &str = ".tmp_";
const CONSUMER_LOCK: &str = ".consumer.lock";

mod defaults {
    pub const fn poll_interval_ms() -> u64 {
        500
    }

    pub const fn recover_inflight() -> bool {
        true
    }
}

/// File-based broker
///
/// Every bound queue is a subdirectory of the broker path. A message is one
/// file holding a bincode-encoded [`Envelope`]:
/// - Ready files: `{available_at_ms:020}-{id}.msg`, so a directory listing
///   sorted by name is sorted by availability
/// - Claimed files: `{id}.inflight`, held by exactly one consumer
/// - Quarantined files: `*.corrupt`, never handed out again
///
/// # Atomicity
/// Messages are written to `.tmp_{id}`, synced when persistent, then renamed
/// into place, so a crash never leaves a partial message visible. Claiming
/// is a rename from `.msg` to `.inflight`; when several consumers race for
/// the same file only one rename succeeds.
///
/// # Recovery
/// [`FileBroker::init`] removes orphaned temporary files and, unless disabled,
/// returns every `.inflight` file to its queue. It first takes an exclusive
/// lock on `.consumer.lock`, so only one consuming process can own a spool;
/// the lock goes away with the process, crashed or not. Publish-only
/// processes never call `init` and can share the spool freely.
///
/// # Security
/// The broker path is validated on construction and queue names are
/// restricted to a safe character set.
#[derive(Debug, Clone)]
pub struct FileBroker {
    path: PathBuf,
    poll_interval: Duration,
    recover_inflight: bool,
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    bindings: RwLock<HashMap<Destination, String>>,
    notify: Notify,
    /// Held from `init` until the last clone is dropped.
    consumer_lock: Mutex<Option<std::fs::File>>,
}

enum Claim {
    Ready(Delivery),
    Wait(Option<u64>),
}

impl Default for FileBroker {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/courier"),
            poll_interval: Duration::from_millis(defaults::poll_interval_ms()),
            recover_inflight: defaults::recover_inflight(),
            shared: Arc::default(),
        }
    }
}

impl<'de> Deserialize<'de> for FileBroker {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileBrokerHelper {
            path: PathBuf,
            #[serde(default = "defaults::poll_interval_ms")]
            poll_interval_ms: u64,
            #[serde(default = "defaults::recover_inflight")]
            recover_inflight: bool,
        }

        let helper = FileBrokerHelper::deserialize(deserializer)?;
        Self::validate_path(&helper.path).map_err(serde::de::Error::custom)?;

        Ok(Self {
            path: helper.path,
            poll_interval: Duration::from_millis(helper.poll_interval_ms),
            recover_inflight: helper.recover_inflight,
            shared: Arc::default(),
        })
    }
}

impl FileBroker {
    /// Validate a broker path
    ///
    /// # Errors
    /// If the path is relative, contains `..`, or sits in a system directory
    fn validate_path(path: &Path) -> Result<(), ValidationError> {
        if path
            .components()
            .any(|component| component == std::path::Component::ParentDir)
        {
            return Err(ValidationError::ParentDirectory(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        for prefix in sensitive_prefixes {
            if path.starts_with(prefix) {
                return Err(ValidationError::SystemDirectory {
                    prefix: prefix.to_string(),
                    path: path.display().to_string(),
                });
            }
        }

        Ok(())
    }

    /// Queue names become directory names, so keep them boring.
    fn validate_queue(queue: &str) -> Result<(), ValidationError> {
        let valid = !queue.is_empty()
            && !queue.starts_with('.')
            && queue
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));

        if valid {
            Ok(())
        } else {
            Err(ValidationError::InvalidQueueName(queue.to_string()))
        }
    }

    #[must_use]
    pub fn builder() -> FileBrokerBuilder {
        FileBrokerBuilder::default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn queue_dir(&self, queue: &str) -> PathBuf {
        self.path.join(queue)
    }

    fn inflight_path(&self, handle: &AckHandle) -> PathBuf {
        self.queue_dir(handle.queue())
            .join(format!("{}{INFLIGHT_SUFFIX}", handle.id()))
    }

    /// Initialise the broker directory and recover from a previous crash
    ///
    /// Creates the broker path if needed, removes orphaned `.tmp_` files and,
    /// when `recover_inflight` is set, returns claimed messages to their
    /// queues marked as redelivered.
    ///
    /// Returns the number of messages recovered.
    ///
    /// # Errors
    /// - If the broker path cannot be created or is not a directory
    /// - If a queue directory cannot be read or rewritten
    pub fn init(&self) -> Result<usize, BrokerError> {
        internal!("Initialising file broker at {}", self.path.display());

        if !self.path.try_exists()? {
            internal!("{} does not exist, creating...", self.path.display());
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
        }

        self.lock_for_consumer()?;

        let mut recovered = 0;
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let dir = entry.path();
            Self::cleanup_temp_files(&dir)?;
            if self.recover_inflight {
                recovered += Self::recover_inflight_files(&dir)?;
            }
        }

        if recovered > 0 {
            internal!(
                level = INFO,
                "Returned {recovered} unacknowledged messages to their queues"
            );
        }

        Ok(recovered)
    }

    fn lock_for_consumer(&self) -> Result<(), BrokerError> {
        let mut held = self.shared.consumer_lock.lock();
        if held.is_some() {
            return Ok(());
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.path.join(CONSUMER_LOCK))?;

        match file.try_lock() {
            Ok(()) => {
                *held = Some(file);
                Ok(())
            }
            Err(std::fs::TryLockError::WouldBlock) => {
                Err(BrokerError::Locked(self.path.display().to_string()))
            }
            Err(std::fs::TryLockError::Error(e)) => Err(e.into()),
        }
    }

    fn cleanup_temp_files(dir: &Path) -> Result<(), BrokerError> {
        let mut cleaned = 0;

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned temporary files in {}",
                dir.display()
            );
        }

        Ok(())
    }

    fn recover_inflight_files(dir: &Path) -> Result<usize, BrokerError> {
        let mut recovered = 0;

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if !filename.ends_with(INFLIGHT_SUFFIX) || MessageId::from_filename(&filename).is_none()
            {
                continue;
            }

            let path = entry.path();
            let envelope = match Envelope::decode(&std::fs::read(&path)?) {
                Ok(envelope) => envelope,
                Err(err) => {
                    internal!(
                        level = ERROR,
                        "Quarantining undecodable message {}: {err}",
                        path.display()
                    );
                    std::fs::rename(&path, path.with_extension("inflight.corrupt"))?;
                    continue;
                }
            };

            let envelope = Envelope {
                redelivered: true,
                available_at_ms: now_ms(),
                ..envelope
            };
            let bytes = envelope.encode()?;
            let temp = dir.join(format!("{TEMP_PREFIX}{}", envelope.id));

            {
                let mut file = std::fs::File::create(&temp)?;
                std::io::Write::write_all(&mut file, &bytes)?;
                file.sync_all()?;
            }
            std::fs::rename(&temp, dir.join(ready_filename(&envelope)))?;
            std::fs::remove_file(&path)?;

            recovered += 1;
        }

        Ok(recovered)
    }

    /// Atomically place an envelope on a queue.
    async fn write_ready(
        &self,
        queue: &str,
        envelope: &Envelope,
        bytes: &[u8],
    ) -> std::io::Result<()> {
        let dir = self.queue_dir(queue);
        let temp = dir.join(format!("{TEMP_PREFIX}{}", envelope.id));

        let mut file = fs::File::create(&temp).await?;
        file.write_all(bytes).await?;
        if envelope.persistent {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp, dir.join(ready_filename(envelope))).await?;

        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Claim, BrokerError> {
        let dir = self.queue_dir(queue);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(BrokerError::UnknownQueue(queue.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let mut ready = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name().to_string_lossy().into_owned();
            if let Some(available_at) = parse_ready(&filename) {
                ready.push((available_at, filename));
            }
        }
        ready.sort();

        let now = now_ms();
        for (available_at, filename) in ready {
            if available_at > now {
                return Ok(Claim::Wait(Some(available_at)));
            }

            let Some(id) = MessageId::from_filename(&filename) else {
                continue;
            };
            let inflight = dir.join(format!("{id}{INFLIGHT_SUFFIX}"));

            match fs::rename(dir.join(&filename), &inflight).await {
                Ok(()) => {}
                // Another consumer got there first
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }

            match Envelope::decode(&fs::read(&inflight).await?) {
                Ok(envelope) => return Ok(Claim::Ready(envelope.into_delivery(queue))),
                Err(err) => {
                    internal!(
                        level = ERROR,
                        "Quarantining undecodable message {id} in {queue}: {err}"
                    );
                    fs::rename(&inflight, dir.join(format!("{id}{CORRUPT_SUFFIX}"))).await?;
                }
            }
        }

        Ok(Claim::Wait(None))
    }

    /// Number of messages waiting on `queue`, including delayed ones
    ///
    /// # Errors
    /// If the queue directory cannot be read
    pub async fn queued(&self, queue: &str) -> Result<usize, BrokerError> {
        self.count(queue, |filename| parse_ready(filename).is_some())
            .await
    }

    /// Number of claimed, unacknowledged messages on `queue`
    ///
    /// # Errors
    /// If the queue directory cannot be read
    pub async fn inflight(&self, queue: &str) -> Result<usize, BrokerError> {
        self.count(queue, |filename| {
            filename.ends_with(INFLIGHT_SUFFIX) && MessageId::from_filename(filename).is_some()
        })
        .await
    }

    async fn count(&self, queue: &str, matches: impl Fn(&str) -> bool) -> Result<usize, BrokerError> {
        let mut entries = fs::read_dir(self.queue_dir(queue)).await?;
        let mut count = 0;

        while let Some(entry) = entries.next_entry().await? {
            if matches(&entry.file_name().to_string_lossy()) {
                count += 1;
            }
        }

        Ok(count)
    }
}

fn ready_filename(envelope: &Envelope) -> String {
    format!(
        "{:020}-{}{READY_SUFFIX}",
        envelope.available_at_ms, envelope.id
    )
}

/// Availability time of a ready file, or `None` for anything else.
fn parse_ready(filename: &str) -> Option<u64> {
    if filename.starts_with(TEMP_PREFIX) || !filename.ends_with(READY_SUFFIX) {
        return None;
    }

    MessageId::from_filename(filename)?;
    filename.split_once('-')?.0.parse().ok()
}

#[async_trait]
impl BrokerTransport for FileBroker {
    async fn bind(&self, topology: &Topology) -> Result<(), BrokerError> {
        Self::validate_queue(&topology.queue)?;
        fs::create_dir_all(self.queue_dir(&topology.queue)).await?;

        self.shared
            .bindings
            .write()
            .insert(topology.destination(), topology.queue.clone());

        internal!(
            level = DEBUG,
            "Bound {} to queue {}",
            topology.destination(),
            topology.queue
        );

        Ok(())
    }

    async fn enqueue(
        &self,
        destination: &Destination,
        payload: Vec<u8>,
        options: EnqueueOptions,
    ) -> Result<MessageId, EnqueueError> {
        let queue = self
            .shared
            .bindings
            .read()
            .get(destination)
            .cloned()
            .ok_or_else(|| EnqueueError::Unroutable(destination.clone()))?;

        let delay_ms = options
            .delay
            .map_or(0, |delay| u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        let enqueued_at_ms = now_ms();
        let envelope = Envelope {
            id: MessageId::generate(),
            destination: destination.clone(),
            payload,
            persistent: options.persistent,
            enqueued_at_ms,
            available_at_ms: enqueued_at_ms.saturating_add(delay_ms),
            redelivered: false,
        };

        let bytes = envelope.encode()?;
        self.write_ready(&queue, &envelope, &bytes).await?;
        self.shared.notify.notify_waiters();

        internal!(
            level = DEBUG,
            "Enqueued {} on {queue} (available in {delay_ms}ms)",
            envelope.id
        );

        Ok(envelope.id)
    }

    async fn receive(&self, queue: &str) -> Result<Delivery, BrokerError> {
        Self::validate_queue(queue)?;

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = match self.claim(queue).await? {
                Claim::Ready(delivery) => return Ok(delivery),
                Claim::Wait(Some(available_at)) => self
                    .poll_interval
                    .min(Duration::from_millis(available_at.saturating_sub(now_ms()))),
                Claim::Wait(None) => self.poll_interval,
            };

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), BrokerError> {
        match fs::remove_file(self.inflight_path(handle)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BrokerError::NotInFlight(handle.id()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn nack(&self, handle: &AckHandle) -> Result<(), BrokerError> {
        let inflight = self.inflight_path(handle);
        let bytes = match fs::read(&inflight).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(BrokerError::NotInFlight(handle.id()));
            }
            Err(err) => return Err(err.into()),
        };

        let envelope = Envelope::decode(&bytes)?;
        let envelope = Envelope {
            redelivered: true,
            available_at_ms: now_ms(),
            ..envelope
        };

        let bytes = envelope.encode()?;
        self.write_ready(handle.queue(), &envelope, &bytes).await?;
        fs::remove_file(&inflight).await?;
        self.shared.notify.notify_waiters();

        Ok(())
    }
}

/// Builder for [`FileBroker`]
#[derive(Debug, Default)]
pub struct FileBrokerBuilder {
    path: Option<PathBuf>,
    poll_interval: Option<Duration>,
    recover_inflight: Option<bool>,
}

impl FileBrokerBuilder {
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    #[must_use]
    pub const fn recover_inflight(mut self, recover: bool) -> Self {
        self.recover_inflight = Some(recover);
        self
    }

    /// Build the broker
    ///
    /// # Errors
    /// If the path fails validation
    pub fn build(self) -> Result<FileBroker, ValidationError> {
        let defaults = FileBroker::default();
        let path = self.path.unwrap_or(defaults.path);
        FileBroker::validate_path(&path)?;

        Ok(FileBroker {
            path,
            poll_interval: self.poll_interval.unwrap_or(defaults.poll_interval),
            recover_inflight: self.recover_inflight.unwrap_or(defaults.recover_inflight),
            shared: Arc::default(),
        })
    }
}
