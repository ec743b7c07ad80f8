use crossbeam_channel::{Receiver, Sender};
use dap::prelude::*;
use dap::responses::{
    ContinueResponse, SetBreakpointsResponse, SetExceptionBreakpointsResponse, ThreadsResponse,
};
use dap::types::Breakpoint;
use sdb_bridge::{
    AttachReason, BreakpointRequest, BridgeSettings, EventCallback, EventEnvelope, EventKind,
    ExceptionInfo, HostBridge, HostEvent, OutputStream, ProcessRef, ProgramRef, Status,
    TcpConnector,
};
use std::borrow::Cow;
use std::io;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::engine::ProcessEngine;
use crate::error::DapAdapterError;
use crate::protocol::{LaunchArgs, launch_options};

type DynResult<T> = miette::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Exception category the soft debugger reports managed exceptions under.
pub const CLR_EXCEPTIONS: &str = "CLR";

/// Host callback that queues envelopes for the event pump.
pub struct ChannelCallback {
    sender: Sender<EventEnvelope>,
}

impl EventCallback for ChannelCallback {
    fn event(&self, envelope: EventEnvelope) -> Status {
        match self.sender.send(envelope) {
            Ok(()) => Status::Ok,
            Err(_) => Status::E_FAIL,
        }
    }
}

/// DAP front end for the bridge
pub struct DapAdapter {
    bridge: HostBridge<ProcessEngine>,
    callback: Arc<ChannelCallback>,
    host_event_rx: Receiver<EventEnvelope>,
    process: Option<ProcessRef>,
    program: Option<ProgramRef>,
}

impl DapAdapter {
    pub fn new(settings: BridgeSettings) -> Result<Self, DapAdapterError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let bridge = HostBridge::new(ProcessEngine::default(), Arc::new(TcpConnector), settings)?;

        Ok(Self {
            bridge,
            callback: Arc::new(ChannelCallback { sender: tx }),
            host_event_rx: rx,
            process: None,
            program: None,
        })
    }

    /// Receiver for everything the bridge delivers to the host.
    pub fn host_event_rx(&self) -> Receiver<EventEnvelope> {
        self.host_event_rx.clone()
    }

    pub fn bridge(&self) -> &HostBridge<ProcessEngine> {
        &self.bridge
    }

    fn callback(&self) -> Arc<dyn EventCallback> {
        Arc::clone(&self.callback) as Arc<dyn EventCallback>
    }

    fn launched_process(&self) -> Result<ProcessRef, DapAdapterError> {
        self.process.clone().ok_or(DapAdapterError::NotLaunched)
    }

    pub fn handle_request(
        &mut self,
        req: Request,
        server: &mut Server<impl io::Read, impl io::Write>,
    ) -> DynResult<()> {
        let shutdown = matches!(req.command, Command::Disconnect(_));

        match self.execute(&req.command) {
            Ok(body) => server.respond(req.success(body))?,
            Err(e @ DapAdapterError::UnhandledCommand(_)) => {
                server.respond(req.error(&e.to_string()))?;
                return Err(Box::new(e));
            }
            Err(e) => {
                error!(error = %e, "Request failed");
                server.respond(req.error(&e.to_string()))?;
            }
        }

        if shutdown {
            return Err(Box::new(DapAdapterError::ProtocolError(Cow::Borrowed(
                "Shutdown",
            ))));
        }
        Ok(())
    }

    fn execute(&mut self, command: &Command) -> Result<ResponseBody, DapAdapterError> {
        match command {
            Command::Launch(raw_args) => {
                let additional_data = raw_args
                    .additional_data
                    .as_ref()
                    .ok_or(DapAdapterError::MissingLaunchArguments)?;
                let args: LaunchArgs = serde_json::from_value(additional_data.clone())
                    .map_err(DapAdapterError::LaunchArgumentsError)?;
                debug!(?args, "Received launch request");

                let process = self.bridge.launch_suspended(
                    &launch_options(additional_data, &args),
                    &args.execution_parameters(),
                    self.callback(),
                )?;
                let program = ProgramRef {
                    id: u64::from(process.pid),
                    name: args.program,
                };
                self.process = Some(process);
                self.program = Some(program.clone());

                check(
                    "Attach",
                    self.bridge
                        .attach(&[program], self.callback(), AttachReason::Launch),
                )?;
                Ok(ResponseBody::Launch)
            }
            Command::Attach(_) => {
                let program = self.program.clone().ok_or(DapAdapterError::NotLaunched)?;
                check(
                    "Attach",
                    self.bridge
                        .attach(&[program], self.callback(), AttachReason::User),
                )?;
                Ok(ResponseBody::Attach)
            }
            Command::ConfigurationDone => Ok(ResponseBody::ConfigurationDone),
            Command::Threads => {
                let threads = self
                    .bridge
                    .threads()
                    .into_iter()
                    .map(|thread| types::Thread {
                        id: thread.id,
                        name: thread.name,
                    })
                    .collect();
                Ok(ResponseBody::Threads(ThreadsResponse { threads }))
            }
            Command::Pause(_) => {
                check("CauseBreak", self.bridge.cause_break())?;
                Ok(ResponseBody::Pause)
            }
            Command::Continue(_) => {
                let process = self.launched_process()?;
                check("ResumeProcess", self.bridge.resume_process(&process))?;
                Ok(ResponseBody::Continue(ContinueResponse {
                    all_threads_continued: Some(true),
                }))
            }
            Command::Terminate(_) => {
                let process = self.launched_process()?;
                check("TerminateProcess", self.bridge.terminate_process(&process))?;
                Ok(ResponseBody::Terminate)
            }
            Command::Disconnect(_) => {
                info!("Received Disconnect request");
                if let Some(process) = self.process.take() {
                    let status = self.bridge.terminate_process(&process);
                    if !status.is_ok() {
                        warn!(pid = process.pid, status = %status, "Failed to terminate target on disconnect");
                    }
                }
                if let Some(program) = self.program.take() {
                    self.bridge.destroy_program(&program);
                }
                Ok(ResponseBody::Disconnect)
            }
            Command::SetExceptionBreakpoints(args) => {
                let exceptions: Vec<ExceptionInfo> = args
                    .filters
                    .iter()
                    .map(|filter| ExceptionInfo {
                        name: filter.clone(),
                        guid_type: CLR_EXCEPTIONS.to_string(),
                        break_first_chance: true,
                    })
                    .collect();
                check(
                    "RemoveAllSetExceptions",
                    self.bridge.remove_all_set_exceptions(CLR_EXCEPTIONS),
                )?;
                check("SetException", self.bridge.set_exception(&exceptions))?;
                Ok(ResponseBody::SetExceptionBreakpoints(
                    SetExceptionBreakpointsResponse { breakpoints: None },
                ))
            }
            Command::SetBreakpoints(args) => {
                let file = args
                    .source
                    .path
                    .clone()
                    .or_else(|| args.source.name.clone())
                    .unwrap_or_default();

                let breakpoints = args
                    .breakpoints
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(|bp| {
                        let request = BreakpointRequest {
                            file: file.clone(),
                            line: u32::try_from(bp.line).unwrap_or(0),
                            column: bp.column.and_then(|column| u32::try_from(column).ok()),
                            condition: bp.condition.clone(),
                        };
                        let (verified, id, message) =
                            match self.bridge.create_pending_breakpoint(&request) {
                                Ok(pending) => (true, i64::try_from(pending.id).ok(), None),
                                Err(status) => (
                                    false,
                                    None,
                                    Some(format!("CreatePendingBreakpoint returned {status}")),
                                ),
                            };
                        Breakpoint {
                            verified,
                            line: Some(bp.line),
                            column: bp.column,
                            end_line: None,
                            end_column: None,
                            source: None,
                            message,
                            id,
                            instruction_reference: None,
                            offset: None,
                        }
                    })
                    .collect();

                Ok(ResponseBody::SetBreakpoints(SetBreakpointsResponse {
                    breakpoints,
                }))
            }
            command => Err(DapAdapterError::UnhandledCommand(command.clone())),
        }
    }
}

fn check(method: &'static str, status: Status) -> Result<(), DapAdapterError> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(DapAdapterError::HostCommand { method, status })
    }
}

fn output(text: String, category: types::OutputEventCategory) -> Event {
    Event::Output(events::OutputEventBody {
        output: text,
        category: Some(category),
        group: None,
        variables_reference: None,
        source: None,
        line: None,
        column: None,
        data: None,
    })
}

fn stopped(reason: types::StoppedEventReason, thread_id: Option<i64>, text: Option<String>) -> Event {
    Event::Stopped(events::StoppedEventBody {
        reason,
        description: text.clone(),
        thread_id,
        preserve_focus_hint: Some(false),
        text,
        all_threads_stopped: Some(true),
        hit_breakpoint_ids: None,
    })
}

/// Debug console line for a log record.
pub fn log_output(message: &str) -> Event {
    output(message.to_string(), types::OutputEventCategory::Console)
}

/// DAP events for one host event, in the order they are sent.
pub fn host_events(envelope: &EventEnvelope) -> Vec<Event> {
    let thread_id = envelope.thread.as_ref().map(|thread| thread.id);

    let event = match &envelope.event {
        HostEvent::ThreadCreate => {
            return thread_id
                .map(|thread_id| {
                    Event::Thread(events::ThreadEventBody {
                        reason: types::ThreadEventReason::Started,
                        thread_id,
                    })
                })
                .into_iter()
                .collect();
        }
        HostEvent::Target(event) => event,
    };

    match event.kind {
        EventKind::TargetReady => vec![],
        EventKind::TargetStarted => vec![Event::Continued(events::ContinuedEventBody {
            thread_id: thread_id.unwrap_or_default(),
            all_threads_continued: Some(true),
        })],
        EventKind::ThreadStarted => vec![],
        EventKind::ThreadStopped => thread_id
            .map(|thread_id| {
                Event::Thread(events::ThreadEventBody {
                    reason: types::ThreadEventReason::Exited,
                    thread_id,
                })
            })
            .into_iter()
            .collect(),
        EventKind::BreakpointHit => vec![stopped(
            types::StoppedEventReason::Breakpoint,
            thread_id,
            event.payload.clone(),
        )],
        EventKind::TargetStopped | EventKind::TargetInterrupted => vec![stopped(
            types::StoppedEventReason::Pause,
            thread_id,
            None,
        )],
        EventKind::TargetSignaled | EventKind::ExceptionThrown => vec![stopped(
            types::StoppedEventReason::Exception,
            thread_id,
            event.payload.clone(),
        )],
        EventKind::UnhandledException => vec![output(
            format!(
                "Unhandled exception: {}\n",
                event.payload.as_deref().unwrap_or_default()
            ),
            types::OutputEventCategory::Stderr,
        )],
        EventKind::Output | EventKind::Log => {
            let category = match (event.kind, event.stream) {
                (_, Some(OutputStream::Error)) => types::OutputEventCategory::Stderr,
                (EventKind::Output, _) => types::OutputEventCategory::Stdout,
                _ => types::OutputEventCategory::Console,
            };
            vec![output(event.payload.clone().unwrap_or_default(), category)]
        }
        EventKind::TargetExited => {
            let mut events = Vec::with_capacity(3);
            if let Some(reason) = &event.payload {
                events.push(output(
                    format!("{reason}\n"),
                    types::OutputEventCategory::Stderr,
                ));
            }
            events.push(Event::Exited(events::ExitedEventBody {
                exit_code: event.exit_code.unwrap_or_default(),
            }));
            events.push(Event::Terminated(Some(events::TerminatedEventBody {
                restart: Some(serde_json::Value::Bool(false)),
            })));
            events
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use sdb_bridge::{
        EventAttributes, EngineId, HostEventType, NormalizedEvent, RawTargetEvent, ThreadInfo,
        ThreadRecord,
    };
    use std::io::{BufReader, BufWriter, Cursor};

    type TestServer = Server<Cursor<Vec<u8>>, Cursor<Vec<u8>>>;

    #[fixture]
    fn adapter() -> DapAdapter {
        DapAdapter::new(BridgeSettings::default()).unwrap()
    }

    #[fixture]
    fn server() -> TestServer {
        let input = BufReader::new(Cursor::new(Vec::new()));
        let output = BufWriter::new(Cursor::new(Vec::new()));
        Server::new(input, output)
    }

    fn thread() -> ThreadInfo {
        ThreadInfo {
            id: 7,
            name: "Main Thread".to_string(),
            location: "Program.Main".to_string(),
        }
    }

    fn envelope(event: HostEvent, thread: Option<ThreadInfo>) -> EventEnvelope {
        EventEnvelope {
            engine: EngineId::bridge(),
            process: Some(ProcessRef { pid: 42 }),
            program: ProgramRef {
                id: 42,
                name: "App.exe".to_string(),
            },
            thread: thread.as_ref().map(ThreadRecord::from),
            event_type: HostEventType::of(&event),
            attributes: EventAttributes::of(&event),
            event,
        }
    }

    fn target(raw: RawTargetEvent) -> HostEvent {
        HostEvent::Target(NormalizedEvent::normalize(raw))
    }

    fn shutdown_requested(result: &DynResult<()>) -> bool {
        result
            .as_ref()
            .err()
            .and_then(|e| e.downcast_ref::<DapAdapterError>())
            .is_some_and(DapAdapterError::is_shutdown)
    }

    #[rstest]
    fn test_handle_request_threads_before_launch(mut adapter: DapAdapter, mut server: TestServer) {
        let req = Request {
            seq: 1,
            command: Command::Threads,
        };
        assert!(adapter.handle_request(req, &mut server).is_ok());
        assert!(adapter.bridge().threads().is_empty());
    }

    #[rstest]
    fn test_handle_request_configuration_done(mut adapter: DapAdapter, mut server: TestServer) {
        let req = Request {
            seq: 1,
            command: Command::ConfigurationDone,
        };
        assert!(adapter.handle_request(req, &mut server).is_ok());
    }

    #[rstest]
    #[case::continue_request(Command::Continue(dap::requests::ContinueArguments {
        thread_id: 1,
        single_thread: None,
    }))]
    #[case::pause(Command::Pause(dap::requests::PauseArguments { thread_id: 1 }))]
    fn test_commands_before_launch_answer_with_error(
        mut adapter: DapAdapter,
        mut server: TestServer,
        #[case] command: Command,
    ) {
        let req = Request { seq: 1, command };
        assert!(adapter.handle_request(req, &mut server).is_ok());
        assert!(adapter.bridge().session().is_none());
    }

    #[rstest]
    fn test_handle_request_launch_without_arguments(
        mut adapter: DapAdapter,
        mut server: TestServer,
    ) {
        let req = Request {
            seq: 1,
            command: Command::Launch(dap::requests::LaunchRequestArguments {
                no_debug: None,
                restart_data: None,
                additional_data: None,
            }),
        };
        assert!(adapter.handle_request(req, &mut server).is_ok());
        assert!(adapter.bridge().session().is_none());
    }

    #[rstest]
    fn test_handle_request_launch_with_malformed_options(
        mut adapter: DapAdapter,
        mut server: TestServer,
    ) {
        let req = Request {
            seq: 1,
            command: Command::Launch(dap::requests::LaunchRequestArguments {
                no_debug: None,
                restart_data: None,
                additional_data: Some(serde_json::json!({"program": "App.exe"})),
            }),
        };
        assert!(adapter.handle_request(req, &mut server).is_ok());
        assert!(adapter.bridge().session().is_none());
    }

    #[rstest]
    fn test_handle_request_set_breakpoints(mut adapter: DapAdapter, mut server: TestServer) {
        let source = dap::types::Source {
            path: Some("/src/Program.cs".to_string()),
            ..Default::default()
        };
        let breakpoints = vec![
            dap::types::SourceBreakpoint {
                line: 10,
                column: Some(5),
                condition: None,
                hit_condition: None,
                log_message: None,
            },
            dap::types::SourceBreakpoint {
                line: 20,
                column: None,
                condition: Some("count > 2".to_string()),
                hit_condition: None,
                log_message: None,
            },
        ];

        #[allow(deprecated)]
        let req = Request {
            seq: 1,
            command: Command::SetBreakpoints(dap::requests::SetBreakpointsArguments {
                source,
                breakpoints: Some(breakpoints),
                lines: None,
                source_modified: None,
            }),
        };

        assert!(adapter.handle_request(req, &mut server).is_ok());
        let pending = adapter.bridge().engine().breakpoints();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].request.file, "/src/Program.cs");
        assert_eq!(pending[0].request.column, Some(5));
        assert_eq!(pending[1].request.condition.as_deref(), Some("count > 2"));
    }

    #[rstest]
    fn test_handle_request_set_exception_breakpoints_replaces_filters(
        mut adapter: DapAdapter,
        mut server: TestServer,
    ) {
        for (seq, filters) in [(1, vec!["all", "user-unhandled"]), (2, vec!["all"])] {
            let req = Request {
                seq,
                command: Command::SetExceptionBreakpoints(
                    dap::requests::SetExceptionBreakpointsArguments {
                        filters: filters.into_iter().map(String::from).collect(),
                        filter_options: None,
                        exception_options: None,
                    },
                ),
            };
            assert!(adapter.handle_request(req, &mut server).is_ok());
        }

        let exceptions = adapter.bridge().engine().exceptions();
        assert_eq!(exceptions.len(), 1);
        assert_eq!(exceptions[0].name, "all");
        assert_eq!(exceptions[0].guid_type, CLR_EXCEPTIONS);
    }

    #[rstest]
    fn test_handle_request_disconnect(mut adapter: DapAdapter, mut server: TestServer) {
        let req = Request {
            seq: 1,
            command: Command::Disconnect(dap::requests::DisconnectArguments {
                restart: None,
                terminate_debuggee: None,
                suspend_debuggee: None,
            }),
        };
        let result = adapter.handle_request(req, &mut server);
        assert!(shutdown_requested(&result));
    }

    #[rstest]
    fn test_handle_request_unhandled(mut adapter: DapAdapter, mut server: TestServer) {
        let req = Request {
            seq: 1,
            command: Command::Scopes(dap::requests::ScopesArguments { frame_id: 0 }),
        };
        let result = adapter.handle_request(req, &mut server);
        assert!(matches!(
            result
                .as_ref()
                .err()
                .and_then(|e| e.downcast_ref::<DapAdapterError>()),
            Some(DapAdapterError::UnhandledCommand(_))
        ));
    }

    #[test]
    fn test_channel_callback_reports_closed_receiver() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let callback = ChannelCallback { sender: tx };
        let event = envelope(HostEvent::ThreadCreate, Some(thread()));

        assert_eq!(callback.event(event.clone()), Status::Ok);
        assert_eq!(rx.try_recv().unwrap().event_type, HostEventType::ThreadCreate);
        drop(rx);
        assert_eq!(callback.event(event), Status::E_FAIL);
    }

    #[test]
    fn test_thread_create_becomes_thread_started() {
        let events = host_events(&envelope(HostEvent::ThreadCreate, Some(thread())));
        assert!(matches!(
            events.as_slice(),
            [Event::Thread(events::ThreadEventBody {
                reason: types::ThreadEventReason::Started,
                thread_id: 7,
                ..
            })]
        ));
    }

    #[test]
    fn test_breakpoint_hit_becomes_stopped() {
        let events = host_events(&envelope(
            target(RawTargetEvent::BreakpointHit {
                thread: Some(thread()),
                location: Some("Program.cs:10".to_string()),
            }),
            Some(thread()),
        ));
        assert!(matches!(
            events.as_slice(),
            [Event::Stopped(events::StoppedEventBody {
                reason: types::StoppedEventReason::Breakpoint,
                thread_id: Some(7),
                ..
            })]
        ));
    }

    #[rstest]
    #[case::normal(RawTargetEvent::Output { stderr: false, text: "hi".to_string() }, types::OutputEventCategory::Stdout)]
    #[case::error(RawTargetEvent::Output { stderr: true, text: "hi".to_string() }, types::OutputEventCategory::Stderr)]
    #[case::log(RawTargetEvent::Log { stderr: false, text: "hi".to_string() }, types::OutputEventCategory::Console)]
    fn test_output_category(
        #[case] raw: RawTargetEvent,
        #[case] expected: types::OutputEventCategory,
    ) {
        let events = host_events(&envelope(target(raw), None));
        let [Event::Output(body)] = events.as_slice() else {
            panic!("expected one output event, got {events:?}");
        };
        assert_eq!(body.output, "hi");
        assert_eq!(
            std::mem::discriminant(body.category.as_ref().unwrap()),
            std::mem::discriminant(&expected)
        );
    }

    #[test]
    fn test_exit_with_reason_reports_then_terminates() {
        let events = host_events(&envelope(
            target(RawTargetEvent::TargetExited {
                exit_code: None,
                reason: Some("Connection refused".to_string()),
            }),
            None,
        ));
        assert!(matches!(
            events.as_slice(),
            [
                Event::Output(_),
                Event::Exited(events::ExitedEventBody { exit_code: 0, .. }),
                Event::Terminated(_)
            ]
        ));
    }

    #[test]
    fn test_target_ready_sends_nothing() {
        assert!(host_events(&envelope(target(RawTargetEvent::TargetReady), None)).is_empty());
    }
}
