use crate::engine::Action;
use ferrite::logging;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::process::Stdio;
use std::rc::Rc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

/// Child lifecycle notifications fed back into the engine's process table.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { pid: u16, bytes: Vec<u8> },
    Exited { pid: u16, exit_code: u8 },
}

/// Executes the engine's spawn/kill requests on the local system. Children
/// run under `/bin/sh -c`; stdout and stderr stream back interleaved, and a
/// watcher per child guarantees the exit event even if nobody polls.
pub struct Runner {
    events: mpsc::UnboundedSender<ProcessEvent>,
    kills: Rc<RefCell<HashMap<u16, oneshot::Sender<()>>>>,
    log: logging::Logger,
}

impl Runner {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        events: mpsc::UnboundedSender<ProcessEvent>,
        log: L,
    ) -> Runner {
        let runner_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Runner {
            events,
            kills: Rc::new(RefCell::new(HashMap::new())),
            log: runner_log,
        }
    }

    /// Handle one process action. Non-process actions are ignored.
    pub fn execute(&self, action: Action) {
        match action {
            Action::SpawnProcess { pid, command_line } => {
                logging::debug!(self.log, "spawning process";
                                "pid" => pid,
                                "command" => &command_line);

                let (kill_tx, kill_rx) = oneshot::channel();
                self.kills.borrow_mut().insert(pid, kill_tx);

                let events = self.events.clone();
                let kills = self.kills.clone();
                let log = self.log.new(logging::o!());

                tokio::task::spawn_local(async move {
                    run_child(pid, command_line, events, kill_rx, log).await;
                    kills.borrow_mut().remove(&pid);
                });
            }
            Action::KillProcess { pid } => {
                if let Some(kill) = self.kills.borrow_mut().remove(&pid) {
                    let _ = kill.send(());
                }
            }
            Action::SetBaudrate { .. } => (),
        }
    }
}

async fn run_child(
    pid: u16,
    command_line: String,
    events: mpsc::UnboundedSender<ProcessEvent>,
    kill_rx: oneshot::Receiver<()>,
    log: logging::Logger,
) {
    let mut child = match Command::new("/bin/sh")
        .arg("-c")
        .arg(&command_line)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(error) => {
            logging::warn!(log, "spawn failed"; "pid" => pid, "error" => %error);
            let _ = events.send(ProcessEvent::Exited {
                pid,
                exit_code: 127,
            });
            return;
        }
    };

    let mut stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");

    let mut out_buf = [0u8; 1024];
    let mut err_buf = [0u8; 1024];
    let mut out_done = false;
    let mut err_done = false;
    let mut killed = false;
    let mut kill_rx = kill_rx;

    while !out_done || !err_done {
        tokio::select! {
            read = stdout.read(&mut out_buf), if !out_done => match read {
                Ok(0) | Err(_) => out_done = true,
                Ok(count) => {
                    let _ = events.send(ProcessEvent::Output {
                        pid,
                        bytes: out_buf[..count].to_vec(),
                    });
                }
            },
            read = stderr.read(&mut err_buf), if !err_done => match read {
                Ok(0) | Err(_) => err_done = true,
                Ok(count) => {
                    let _ = events.send(ProcessEvent::Output {
                        pid,
                        bytes: err_buf[..count].to_vec(),
                    });
                }
            },
            _ = &mut kill_rx, if !killed => {
                killed = true;
                if let Err(error) = child.start_kill() {
                    logging::warn!(log, "kill failed"; "pid" => pid, "error" => %error);
                }
            },
        }
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code().map(|code| (code & 0xff) as u8).unwrap_or(255),
        Err(_) => 255,
    };

    logging::debug!(log, "process exited"; "pid" => pid, "exit_code" => exit_code);
    let _ = events.send(ProcessEvent::Exited { pid, exit_code });
}
