//! Mailbox traffic opcodes

use crate::bytecode::{Instruction, Lambda, Opcode, Value};
use crate::error::{ExecError, ExecResult};
use crate::runtime::executor::Executor;
use crate::runtime::mailbox::{Acknowledgment, AckStatus, Message};
use crate::runtime::process::{ProcessContext, WaitKind};
use crate::types::{MailboxPolicy, Pid, ProcessState};

impl Executor {
    pub(super) fn exec_message(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Value> {
        let op = instruction.opcode.name();
        let max = self.config.max_stack_size;
        match instruction.opcode {
            Opcode::Send => {
                let value = process.pop_value(op)?;
                let target_value = process.pop_value(op)?;
                let target = self.resolve_address(&target_value)?;
                self.send_to(process, target, value)?;
            }
            Opcode::SendAfter => {
                let delay_value = process.pop_value(op)?;
                let value = process.pop_value(op)?;
                let target_value = process.pop_value(op)?;
                let target = self.resolve_address(&target_value)?;
                let delay = Self::value_as_seconds(&delay_value, "send delay")?;
                let message =
                    Message::new(process.pid, value).with_ttl(self.config.default_message_ttl);
                let timer = self.timers.lock().schedule(target, message, delay);
                process.push_value(Value::Uint(timer), max)?;
            }
            Opcode::Receive => {
                let shifted = process.mailbox.lock().shift();
                match shifted {
                    Some(message) => {
                        self.acknowledge(process, &message, AckStatus::Processed);
                        process.push_value(message.value, max)?;
                    }
                    None => {
                        // Rewind so the receive re-runs on wake
                        process.ip -= 1;
                        process.park_receiving(
                            WaitKind::Receive {
                                pattern: None,
                                matcher: None,
                                timeout_result: false,
                            },
                            None,
                        );
                    }
                }
            }
            Opcode::ReceiveWithTimeout => {
                // A null operand means the configured default timeout
                let timeout = if instruction.operand == Value::Null {
                    self.config.default_receive_timeout
                } else {
                    Self::value_as_seconds(&instruction.operand, "receive timeout")?
                };
                let shifted = process.mailbox.lock().shift();
                match shifted {
                    Some(message) => {
                        self.acknowledge(process, &message, AckStatus::Processed);
                        process.push_value(message.value, max)?;
                        process.push_value(Value::Bool(true), max)?;
                    }
                    None if timeout.is_zero() => {
                        process.push_value(Value::Null, max)?;
                        process.push_value(Value::Bool(false), max)?;
                    }
                    None => {
                        process.ip -= 1;
                        process.park_receiving(
                            WaitKind::Receive {
                                pattern: None,
                                matcher: None,
                                timeout_result: true,
                            },
                            Some(timeout),
                        );
                    }
                }
            }
            Opcode::ReceiveSelective => {
                let matcher = self.matcher_from(process, instruction)?;
                match self.scan_selective(process, &matcher)? {
                    Some(message) => {
                        self.acknowledge(process, &message, AckStatus::Processed);
                        process.push_value(message.value, max)?;
                    }
                    None => {
                        process.ip -= 1;
                        process.park_receiving(
                            WaitKind::Receive {
                                pattern: None,
                                matcher: Some(matcher),
                                timeout_result: false,
                            },
                            None,
                        );
                    }
                }
            }
            Opcode::ReceiveSelectiveWithTimeout => {
                let timeout_value = process.pop_value(op)?;
                let timeout = if timeout_value == Value::Null {
                    self.config.default_receive_timeout
                } else {
                    Self::value_as_seconds(&timeout_value, "receive timeout")?
                };
                let matcher = self.matcher_from(process, instruction)?;
                match self.scan_selective(process, &matcher)? {
                    Some(message) => {
                        self.acknowledge(process, &message, AckStatus::Processed);
                        process.push_value(message.value, max)?;
                        process.push_value(Value::Bool(true), max)?;
                    }
                    None if timeout.is_zero() => {
                        process.push_value(Value::Null, max)?;
                        process.push_value(Value::Bool(false), max)?;
                    }
                    None => {
                        process.ip -= 1;
                        process.park_receiving(
                            WaitKind::Receive {
                                pattern: None,
                                matcher: Some(matcher),
                                timeout_result: true,
                            },
                            Some(timeout),
                        );
                    }
                }
            }
            Opcode::Peek => {
                let head = process
                    .mailbox
                    .lock()
                    .peek()
                    .map(|message| message.value)
                    .unwrap_or(Value::Null);
                process.push_value(head, max)?;
            }
            Opcode::MailboxSize => {
                let size = process.mailbox.lock().len() as u64;
                process.push_value(Value::Uint(size), max)?;
            }
            Opcode::CancelTimer => {
                let timer_value = process.pop_value(op)?;
                let timer = Self::value_as_index(&timer_value, "timer reference")? as u64;
                let cancelled = self.timers.lock().cancel(timer);
                process.push_value(Value::Bool(cancelled), max)?;
            }
            _ => unreachable!("non-message opcode routed to exec_message"),
        }
        Ok(Value::Null)
    }

    /// Deliver a message, honoring the mailbox-full policy, and move a
    /// satisfied waiting receiver to the reactivation queue.
    fn send_to(
        &self,
        process: &mut ProcessContext,
        target: Pid,
        value: Value,
    ) -> ExecResult<()> {
        self.stats.lock().messages_sent += 1;
        if target != process.pid && !self.table.is_alive(target) {
            // Sends to dead processes are quietly discarded
            self.stats.lock().messages_dropped += 1;
            return Ok(());
        }
        let mut message =
            Message::new(process.pid, value).with_ttl(self.config.default_message_ttl);
        if self.config.enable_message_acknowledgments {
            message = message.with_ack();
        }

        if target == process.pid {
            let accepted = process.mailbox.lock().push(message);
            if !accepted {
                return self.handle_full_mailbox(process, target, None);
            }
            self.stats.lock().messages_delivered += 1;
            return Ok(());
        }

        let Some(mailbox) = self.table.mailbox(target) else {
            self.stats.lock().messages_dropped += 1;
            return Ok(());
        };
        let accepted = mailbox.lock().push(message.clone());
        if !accepted {
            return self.handle_full_mailbox(process, target, Some(message));
        }
        self.stats.lock().messages_delivered += 1;
        if message.needs_ack {
            process.mailbox.lock().push_ack(Acknowledgment {
                message_id: message.id,
                receiver: target,
                status: AckStatus::Delivered,
            });
        }
        if self.config.auto_reactivate_processes && self.receiver_satisfied(target, &message) {
            self.reactivations.lock().push_back(target);
        }
        Ok(())
    }

    fn handle_full_mailbox(
        &self,
        process: &mut ProcessContext,
        target: Pid,
        message: Option<Message>,
    ) -> ExecResult<()> {
        match self.config.mailbox_full_behavior {
            MailboxPolicy::Fail => Err(ExecError::MailboxOverflow(target)),
            MailboxPolicy::Drop => {
                self.stats.lock().messages_dropped += 1;
                Ok(())
            }
            MailboxPolicy::Block => {
                let Some(message) = message else {
                    // A self-send cannot block on its own mailbox
                    self.stats.lock().messages_dropped += 1;
                    return Ok(());
                };
                process.blocked_sends.push_back((target, message));
                process.state = ProcessState::Blocked;
                process.dependencies.insert(target);
                Ok(())
            }
        }
    }

    /// Whether a waiting receiver's predicate is satisfied by the message.
    /// Matcher waits are woken unconditionally and re-scan themselves.
    fn receiver_satisfied(&self, target: Pid, message: &Message) -> bool {
        let Some(handle) = self.table.get(target) else {
            return false;
        };
        let receiver = handle.read();
        if receiver.state != ProcessState::Waiting {
            return false;
        }
        match &receiver.waiting {
            Some(WaitKind::Receive { pattern, .. }) => match pattern {
                Some(pattern) => crate::runtime::mailbox::matches(&message.value, pattern),
                None => true,
            },
            Some(WaitKind::Sleep) | None => false,
        }
    }

    fn matcher_from(
        &self,
        process: &mut ProcessContext,
        instruction: &Instruction,
    ) -> ExecResult<Lambda> {
        let value = self.operand_or_pop(process, instruction)?;
        match value {
            Value::Lambda(lambda) => Ok(lambda),
            Value::Instructions(code) => Ok(Lambda::new(Vec::new(), code)),
            other => Err(ExecError::TypeMismatch(format!(
                "selective receive expects a matcher lambda, got {}",
                other.type_name()
            ))),
        }
    }

    /// Scan the mailbox front to back, removing and returning the first
    /// message the matcher accepts. The mailbox lock is not held while the
    /// matcher runs.
    pub(super) fn scan_selective(
        &self,
        process: &mut ProcessContext,
        matcher: &Lambda,
    ) -> ExecResult<Option<Message>> {
        let snapshot: Vec<(usize, Value)> = {
            let mailbox = process.mailbox.lock();
            mailbox
                .iter()
                .enumerate()
                .map(|(index, message)| (index, message.value.clone()))
                .collect()
        };
        for (index, value) in snapshot {
            let verdict = self.run_inline(process, matcher, vec![value])?;
            if verdict.is_truthy() {
                return Ok(process.mailbox.lock().remove_at(index));
            }
        }
        Ok(None)
    }

    fn acknowledge(&self, process: &ProcessContext, message: &Message, status: AckStatus) {
        if !message.needs_ack || message.from == process.pid {
            return;
        }
        if let Some(mailbox) = self.table.mailbox(message.from) {
            mailbox.lock().push_ack(Acknowledgment {
                message_id: message.id,
                receiver: process.pid,
                status,
            });
        }
    }
}
