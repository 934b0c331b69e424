// Delivered and read receipts
//
// Inbound chat is acknowledged as delivered when it is stored; `mark_read`
// acknowledges everything the contact sent us that we have not read yet.
// Receipts only ever move a stored status forward.

use log::{debug, info};

use super::session::SessionActor;
use super::{SendFailure, SessionManager};
use crate::models::{DeliveryStatus, Payload, Receipt};

impl SessionActor {
    pub(crate) fn send_receipt(
        &mut self,
        contact_id: &str,
        message_ids: Vec<String>,
        status: DeliveryStatus,
    ) -> Result<String, SendFailure> {
        debug!("Sending {:?} receipt for {} message(s) to {}", status, message_ids.len(), contact_id);
        self.send(contact_id, Payload::ReadReceipt(Receipt { message_ids, status }))
    }

    /// Apply a receipt from `sender` to the messages we sent them.
    pub(crate) fn apply_receipt(&mut self, sender: &str, receipt: &Receipt) {
        let local_id = self.local.id.clone();
        let mut updated = 0;
        for id in &receipt.message_ids {
            let ours = self
                .store
                .get(sender)
                .iter()
                .any(|stored| stored.message.id == *id && stored.message.sender == local_id);
            if ours && self.store.update_status(sender, id, receipt.status) {
                updated += 1;
            }
        }
        debug!(
            "{:?} receipt from {} updated {}/{} message(s)",
            receipt.status,
            sender,
            updated,
            receipt.message_ids.len()
        );
    }

    pub(crate) fn mark_read(&mut self, contact_id: &str) -> Result<usize, SendFailure> {
        let unread: Vec<String> = self
            .store
            .get(contact_id)
            .iter()
            .filter(|stored| stored.message.sender == contact_id && stored.status < DeliveryStatus::Read)
            .map(|stored| stored.message.id.clone())
            .collect();
        if unread.is_empty() {
            return Ok(0);
        }

        self.send_receipt(contact_id, unread.clone(), DeliveryStatus::Read)?;
        for id in &unread {
            self.store.update_status(contact_id, id, DeliveryStatus::Read);
        }
        info!("Marked {} message(s) from {} as read", unread.len(), contact_id);
        Ok(unread.len())
    }
}

impl SessionManager {
    /// Mark the contact's messages as read and tell them. Returns how many
    /// messages changed.
    pub async fn mark_read(&self, contact_id: &str) -> Result<usize, SendFailure> {
        let contact_id = contact_id.to_string();
        self.invoke(move |actor| actor.mark_read(&contact_id))
            .await
            .map_err(|_| SendFailure::Closed)?
    }
}
