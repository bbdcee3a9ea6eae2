//! Ledger APDU adapter

use super::{Prompter, Result, SignerError, UsbLink};
use common::UiPayload;
use protocol::Apdu;
use protocol::ledger::{self, Decoder, Response};
use std::time::Duration;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

pub struct Ledger {
    link: UsbLink,
    ui: Prompter,
    poll_interval: Duration,
}

impl Ledger {
    pub fn new(link: UsbLink, ui: Prompter, poll_interval: Duration) -> Self {
        Self {
            link,
            ui,
            poll_interval,
        }
    }

    /// Send one serialized APDU and return the response data
    ///
    /// Any status word other than 0x9000 comes back as
    /// [`SignerError::Status`]. The device holds its answer while it asks the
    /// user to confirm, so the first report may take up to the interactive
    /// limit.
    pub async fn exchange(&self, command: &[u8]) -> Result<Vec<u8>> {
        for report in ledger::encode(command)? {
            self.link.write_report(&report).await?;
        }

        let limit = self.link.timeouts().interactive;
        let mut report = self.link.await_report(limit).await?;
        let mut decoder = Decoder::new();
        let raw = loop {
            if let Some(raw) = decoder.push(&report)? {
                break raw;
            }
            report = self.link.read_report().await?;
        };

        let response = Response::parse(raw)?;
        debug!(
            "Ledger replied {} with {} bytes",
            response.status,
            response.data.len()
        );
        if response.status.is_ok() {
            Ok(response.data)
        } else {
            Err(SignerError::Status(response.status))
        }
    }

    pub async fn exchange_apdu(&self, apdu: &Apdu) -> Result<Vec<u8>> {
        self.exchange(&apdu.serialize()?).await
    }

    /// Like [`Ledger::exchange`], but waits out a locked device or a wrong app
    ///
    /// While the device refuses, the user sees a cancellable notice and the
    /// command is retried every poll interval. Ends when the command goes
    /// through, fails for another reason, or the user cancels. A notice that
    /// closes without a cancel leaves the polling running.
    pub async fn exchange_interactive(&self, command: &[u8]) -> Result<Vec<u8>> {
        let refusal = match self.exchange(command).await {
            Err(e) if e.is_locked() || e.is_wrong_app() => e,
            other => return other,
        };

        let text = if refusal.is_locked() {
            "Unlock your Ledger to continue"
        } else {
            "Open the matching application on your Ledger"
        };
        info!("Waiting for the user: {}", refusal);

        let (hail, answer) = self.ui.cancellable_hail(text)?;
        // Its own task keeps the hail's subscription draining while a
        // re-poll is in flight
        let mut answer = Some(tokio::spawn(answer));

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let result = loop {
            let attempt = async {
                ticker.tick().await;
                self.exchange(command).await
            };
            tokio::pin!(attempt);

            let outcome = loop {
                let Some(waiting) = answer.as_mut() else {
                    break attempt.as_mut().await;
                };
                tokio::select! {
                    outcome = attempt.as_mut() => break outcome,
                    joined = waiting => {
                        answer = None;
                        match joined {
                            Ok(Ok(UiPayload::Cancelled)) => break Err(SignerError::Cancelled),
                            Ok(Ok(UiPayload::Dismissed)) => {
                                debug!("Hail closed, still waiting for the Ledger");
                            }
                            Ok(Ok(other)) => {
                                break Err(SignerError::UnexpectedReply(format!("{:?}", other)));
                            }
                            Ok(Err(e)) => break Err(e),
                            Err(e) => {
                                break Err(SignerError::UnexpectedReply(format!(
                                    "hail task failed: {}",
                                    e
                                )));
                            }
                        }
                    }
                }
            };

            match outcome {
                Ok(data) => break Ok(data),
                Err(e) if e.is_locked() || e.is_wrong_app() => {
                    debug!("Ledger still refusing: {}", e);
                }
                Err(e) => break Err(e),
            }
        };

        if let Some(waiting) = answer {
            waiting.abort();
        }
        self.ui.remove_hail(hail);
        result
    }
}
