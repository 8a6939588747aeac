use std::{collections::BTreeSet, sync::Arc};

use super::TransmissionPolicy;
use crate::{
    diagnostics::DiagnosticEvent,
    serializer,
    transmission::{
        backoff::{self, status},
        transmitter::Capacities,
        TransmissionProcessed, Transmitter,
    },
};

const NAME: &str = "partial-success";

/// Resends only the items a 206 response rejected for transient reasons.
#[derive(Debug, Default)]
pub struct PartialSuccessPolicy;

impl PartialSuccessPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl TransmissionPolicy for PartialSuccessPolicy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn capacities(&self) -> Capacities {
        Capacities::UNCONSTRAINED
    }

    fn on_transmission_processed(
        &self,
        transmitter: &Arc<Transmitter>,
        event: &TransmissionProcessed,
    ) -> anyhow::Result<()> {
        let Some(response) = event.response.as_ref() else {
            return Ok(());
        };
        if response.status != status::PARTIAL_SUCCESS {
            return Ok(());
        }
        let Some(backend) = backoff::parse_backend_response(response.body.as_deref()) else {
            return Ok(());
        };
        if backend.items_received == backend.items_accepted {
            return Ok(());
        }

        let transmission = &event.transmission;
        if !transmission.content_encoding().is_empty() {
            anyhow::bail!(
                "cannot split payload with content encoding `{}`",
                transmission.content_encoding()
            );
        }
        let items = serializer::split_lines(transmission.content());

        let mut retry = BTreeSet::new();
        for error in &backend.errors {
            if !status::is_retryable_item(error.status_code) {
                continue;
            }
            match usize::try_from(error.index) {
                Ok(index) if index < items.len() => {
                    retry.insert(index);
                }
                _ => transmitter
                    .diagnostics()
                    .report(DiagnosticEvent::PartialSuccessUnexpectedIndex {
                        index: error.index,
                        batch_len: items.len(),
                    }),
            }
        }
        if retry.is_empty() {
            return Ok(());
        }

        let consecutive_errors = transmitter.backoff().record_failure(status::PARTIAL_SUCCESS);
        tracing::debug!(
            id = %transmission.id(),
            received = backend.items_received,
            accepted = backend.items_accepted,
            resent = retry.len(),
            consecutive_errors,
            "Resending items rejected by partial success"
        );
        let content = serializer::join_lines(retry.into_iter().map(|index| items[index].clone()));
        transmitter.enqueue(transmission.with_content(content));
        Ok(())
    }
}
