// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! End-to-end handling of inbound data objects.
//!
//! Incoming objects are verified (large payloads off the kernel task),
//! announced as verified, and handed to the data store; the store posts
//! `DataObjectNew` for non-duplicates and evaluates the registered filters.
//! Inserted ids (duplicates included) land in this node's bloom filter so
//! peers stop offering them. A periodic, jittered pass ages out old
//! persistent objects nobody subscribes to.

use crate::{
    event::Event,
    kernel::KernelHandle,
    store::{self, DataObjectRef},
};
use haggle_protocol::DataState;
use rand::Rng;
use tokio::sync::watch;

pub(crate) struct DataManager {
    kernel: KernelHandle,
    aging_cancel: Option<watch::Sender<bool>>,
}

impl DataManager {
    pub(crate) fn new(kernel: KernelHandle) -> Self {
        Self {
            kernel,
            aging_cancel: None,
        }
    }

    pub(crate) async fn handle_event(&mut self, event: &Event) {
        match event {
            Event::Startup => self.start_aging(),
            Event::DataObjectIncoming(data_object) => self.incoming(data_object),
            Event::DataObjectVerified(data_object) => {
                self.kernel
                    .data_store()
                    .insert_data_object(data_object.clone(), true);
            }
            Event::DataObjectInserted { data_object, .. } => {
                // Duplicates count too: the policy for a duplicate is still
                // "do not fetch this again".
                let id = store::read(data_object).id();
                store::write(&self.kernel.this_node())
                    .bloomfilter_mut()
                    .add(id.as_bytes());
            }
            Event::PrepareShutdown => {
                if let Some(cancel) = self.aging_cancel.take() {
                    let _ = cancel.send(true);
                }
                self.kernel.post(Event::ShutdownReady("DataManager"));
            }
            _ => {}
        }
    }

    fn start_aging(&mut self) {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.aging_cancel = Some(cancel_tx);

        let data_store = self.kernel.data_store().clone();
        let config = self.kernel.config().clone();
        let _handle = tokio::spawn(async move {
            // Jitter the period so co-located nodes do not age in lockstep.
            let jitter = rand::thread_rng().gen_range(0..=config.aging_interval.as_secs() / 10);
            let period = config.aging_interval + std::time::Duration::from_secs(jitter);
            let mut interval = tokio::time::interval(period);
            let _ = interval.tick().await; // first tick fires immediately

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        trace!("triggering data object aging");
                        data_store.age_data_objects(config.aging_max_age);
                    }
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn incoming(&mut self, data_object: &DataObjectRef) {
        let (data_len, needs_offload) = {
            let dobj = store::read(data_object);
            (
                dobj.data_len(),
                dobj.data_len() > self.kernel.config().verify_offload_threshold,
            )
        };

        let events = self.kernel.events().clone();
        let dobj = data_object.clone();

        if needs_offload {
            debug!("verifying {data_len} byte payload off the kernel task");
            let _handle = tokio::task::spawn_blocking(move || {
                let state = store::write(&dobj).verify_data();
                finish_verification(&events, dobj, state);
            });
        } else {
            let state = store::write(&dobj).verify_data();
            finish_verification(&events, dobj, state);
        }
    }
}

fn finish_verification(
    events: &crate::event::EventSender,
    data_object: DataObjectRef,
    state: haggle_protocol::Result<DataState>,
) {
    match state {
        Ok(DataState::VerifiedBad) => {
            // Hash mismatch: drop the object; its payload file goes with it
            // when the last reference does.
            warn!("payload verification failed, dropping data object");
        }
        Ok(_) => events.post(Event::DataObjectVerified(data_object)),
        Err(err) => {
            warn!("could not verify payload: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::new_data_object_ref;
    use haggle_protocol::{Attribute, DataObject};
    use sha1::{Digest, Sha1};

    #[tokio::test]
    async fn bad_payload_is_dropped_before_insert() -> eyre::Result<()> {
        let (kernel, mut events, _guards) = crate::kernel::test_handle();
        let mut manager = DataManager::new(kernel);

        let dir = tempfile::tempdir()?;
        let payload = dir.path().join("p.bin");
        std::fs::write(&payload, b"actual content")?;

        let mut dobj = DataObject::new(dir.path());
        let _ = dobj.add_attribute(Attribute::new("Topic", "Weather"));
        dobj.set_file(&payload)?;
        dobj.set_data_hash(Sha1::digest(b"claimed other content").into());

        manager.incoming(&new_data_object_ref(dobj));
        assert!(
            events.try_recv().is_err(),
            "no verified event for a bad payload"
        );
        Ok(())
    }

    #[tokio::test]
    async fn good_payload_is_announced_verified() -> eyre::Result<()> {
        let (kernel, mut events, _guards) = crate::kernel::test_handle();
        let mut manager = DataManager::new(kernel);

        let dir = tempfile::tempdir()?;
        let payload = dir.path().join("p.bin");
        std::fs::write(&payload, b"bytes")?;

        let mut dobj = DataObject::new(dir.path());
        let _ = dobj.add_attribute(Attribute::new("Topic", "Weather"));
        dobj.set_file(&payload)?;
        dobj.set_data_hash(Sha1::digest(b"bytes").into());

        let dobj = new_data_object_ref(dobj);
        manager.incoming(&dobj);

        let (event, _) = events.recv().await.expect("event");
        assert!(matches!(event, Event::DataObjectVerified(_)));
        assert_eq!(store::read(&dobj).data_state(), DataState::VerifiedOk);
        Ok(())
    }
}
