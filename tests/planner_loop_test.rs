//! Planner 主循环集成测试：Mock 模型 + 真实沙箱（临时目录）

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use atelier::core::{AgentError, AgentOutcome};
    use atelier::delegation::{AgentRuntime, DelegationEngine};
    use atelier::llm::{MockModelService, ModelRole, ModelRouting, ModelService, RuntimeConfig};
    use atelier::middleware::{default_pipeline, ChatMode};
    use atelier::react::{AgentRequest, PlannerLoop, PlannerSettings, ProgressEvent, Stage};
    use atelier::sandbox::{PathGuard, SandboxService, SandboxSettings, DEFAULT_VIRTUAL_ROOT};
    use atelier::tools::{SandboxToolset, ToolExecutor, ToolRegistry};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn planner(dir: &TempDir, mock: &Arc<MockModelService>, max_tool_steps: usize) -> PlannerLoop {
        let model: Arc<dyn ModelService> = mock.clone();
        let routing = ModelRouting::uniform(RuntimeConfig::new("mock", "mock-model"));
        let guard = PathGuard::new(DEFAULT_VIRTUAL_ROOT, dir.path()).unwrap();
        let sandbox = Arc::new(SandboxService::new(guard, SandboxSettings::default()));
        let toolset = SandboxToolset::new(sandbox, Arc::new(ToolRegistry::new()));
        let runtime = AgentRuntime::new(model.clone(), &routing, toolset.clone(), 3);
        let engine = Arc::new(DelegationEngine::new(2, Arc::new(runtime)));
        let executor = Arc::new(ToolExecutor::new(toolset, 10).with_delegation(engine));
        PlannerLoop::new(
            model,
            routing,
            Arc::new(default_pipeline()),
            executor,
            PlannerSettings {
                max_tool_steps,
                failure_stop_threshold: 2,
            },
        )
    }

    fn request(dir: &TempDir, message: &str) -> AgentRequest {
        AgentRequest::new("session-1", message, dir.path())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn output_files(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.path().join("output"))
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_repeated_tool_call_goes_to_synthesis() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockModelService::scripted([
            r#"{"action":"tool","tool":"list_dir","input":{"path":"."}}"#,
            r#"I will look again: {"action":"tool","tool":"list_dir","input":{"path":"."}}"#,
            "The workspace is empty.",
        ]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = planner(&dir, &mock, 8)
            .run(request(&dir, "what is in the workspace?"), Some(tx), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            AgentOutcome::Answered {
                text: "The workspace is empty.".into(),
                saved_path: None,
                steps: 1,
            }
        );
        assert_eq!(mock.call_count(), 3);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| e.stage == Stage::Tool));
        let last = events.last().unwrap();
        assert_eq!(last.stage, Stage::Final);
        assert_eq!(last.payload.as_ref().unwrap()["text"], "The workspace is empty.");
        let streamed: String = events
            .iter()
            .filter(|e| e.stage == Stage::Final && e.message == "delta")
            .map(|e| e.payload.as_ref().unwrap()["delta"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(streamed, "The workspace is empty.");
    }

    #[tokio::test]
    async fn test_unsaved_answer_triggers_exactly_one_fallback_write() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockModelService::scripted([
            r##"{"action":"answer","answer":"# Report"}"##,
            r##"{"action":"answer","answer":"# Report"}"##,
            r##"{"action":"answer","answer":"# Report"}"##,
            "# Report body",
        ]));
        let outcome = planner(&dir, &mock, 3)
            .run(
                request(&dir, "please generate a report and save it to output/report.md"),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let AgentOutcome::Answered { text, saved_path, steps } = outcome else {
            panic!("expected an answer");
        };
        assert_eq!(steps, 0);
        assert_eq!(saved_path.as_deref(), Some("/mnt/workspace/output/report.md"));
        assert!(text.starts_with("# Report body"));
        assert!(text.ends_with("Saved to `/mnt/workspace/output/report.md`"));
        assert_eq!(output_files(&dir), vec!["report.md"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("output/report.md")).unwrap(),
            "# Report body"
        );

        // 草稿阶段模型看到了 PERSIST_REQUIRED
        let second = &mock.requests()[1];
        assert!(second
            .messages
            .iter()
            .any(|m| m.content.contains("PERSIST_REQUIRED")));
    }

    #[tokio::test]
    async fn test_write_file_path_is_injected_for_generated_documents() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockModelService::scripted([
            r##"{"action":"tool","tool":"write_file","input":{"content":"# Overview"}}"##,
            r#"{"action":"answer","answer":"done"}"#,
            "All done",
        ]));
        let outcome = planner(&dir, &mock, 6)
            .run(
                request(&dir, "generate a markdown report about the project"),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let AgentOutcome::Answered { text, saved_path, steps } = outcome else {
            panic!("expected an answer");
        };
        assert_eq!(text, "All done");
        assert_eq!(steps, 1);
        let saved = saved_path.unwrap();
        assert!(saved.starts_with("/mnt/workspace/output/generate-a-markdown-report"));
        assert!(saved.ends_with(".md"));
        assert_eq!(output_files(&dir).len(), 1);
    }

    #[tokio::test]
    async fn test_existing_explicit_target_escalates_to_clarification() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("output")).unwrap();
        std::fs::write(dir.path().join("output/report.md"), "keep me").unwrap();
        // 只有一条脚本：clarifier 调用失败，走模板选项
        let mock = Arc::new(MockModelService::scripted([
            r#"{"action":"tool","tool":"write_file","input":{"path":"output/report.md","content":"new"}}"#,
        ]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = planner(&dir, &mock, 6)
            .run(
                request(&dir, "write the summary to output/report.md"),
                Some(tx),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let AgentOutcome::ClarificationRequired { question, options } = outcome else {
            panic!("expected clarification");
        };
        assert!(question.contains("already exists"));
        assert_eq!(options.len(), 3);
        assert_eq!(options.iter().filter(|o| o.recommended == Some(true)).count(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("output/report.md")).unwrap(),
            "keep me"
        );
        assert!(drain(&mut rx).iter().any(|e| e.stage == Stage::Clarification));
    }

    #[tokio::test]
    async fn test_disallowed_save_path_clarifies_before_planning() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockModelService::default());
        let outcome = planner(&dir, &mock, 6)
            .run(request(&dir, "save the notes to /etc/passwd"), None, CancellationToken::new())
            .await
            .unwrap();

        let AgentOutcome::ClarificationRequired { question, options } = outcome else {
            panic!("expected clarification");
        };
        assert!(question.contains("/etc/passwd"));
        assert_eq!(options.len(), 3);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_ask_clarification_uses_model_options() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockModelService::scripted([
            r#"{"action":"tool","tool":"ask_clarification","input":{"question":"Which file?"}}"#,
            r#"[{"label":"a.txt","value":"Use a.txt","recommended":true},{"label":"b.txt","value":"Use b.txt"},{"label":"Other","value":"Another file"}]"#,
        ]));
        let outcome = planner(&dir, &mock, 6)
            .run(request(&dir, "fix the file"), None, CancellationToken::new())
            .await
            .unwrap();

        let AgentOutcome::ClarificationRequired { question, options } = outcome else {
            panic!("expected clarification");
        };
        assert_eq!(question, "Which file?");
        let labels: Vec<&str> = options.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(labels, vec!["a.txt", "b.txt", "Other"]);
    }

    #[tokio::test]
    async fn test_ask_mode_refuses_writes() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockModelService::scripted([
            r#"{"action":"tool","tool":"write_file","input":{"path":"output/a.txt","content":"hi"}}"#,
            r#"{"action":"answer","answer":"I cannot write in ask mode."}"#,
            "Read-only mode, nothing was written.",
        ]));
        let outcome = planner(&dir, &mock, 6)
            .run(
                request(&dir, "put hi into output/a.txt").with_chat_mode(ChatMode::Ask),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.text(), Some("Read-only mode, nothing was written."));
        assert!(!dir.path().join("output/a.txt").exists());
        // 第一次规划请求的 system prompt 不含被剥离的工具
        let first = &mock.requests()[0];
        assert!(!first.messages[0].content.contains("- write_file:"));
        assert!(mock.requests()[1]
            .messages
            .iter()
            .any(|m| m.content.contains("MODE_RESTRICTED")));
    }

    #[tokio::test]
    async fn test_missing_path_stops_planning_early() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockModelService::scripted([
            r#"{"action":"tool","tool":"read_file","input":{"path":"missing.txt"}}"#,
            "I could not find missing.txt.",
        ]));
        let outcome = planner(&dir, &mock, 6)
            .run(request(&dir, "what does missing.txt say"), None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            AgentOutcome::Answered {
                text: "I could not find missing.txt.".into(),
                saved_path: None,
                steps: 1,
            }
        );
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_request_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockModelService::echo());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = planner(&dir, &mock, 6)
            .run(request(&dir, "hello"), None, cancel)
            .await
            .unwrap();
        assert_eq!(outcome, AgentOutcome::Cancelled);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_model_failure_is_role_annotated_and_reported() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockModelService::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = planner(&dir, &mock, 6)
            .run(request(&dir, "hello"), Some(tx), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AgentError::Model {
                role: ModelRole::Planner,
                ..
            }
        ));
        let events = drain(&mut rx);
        assert_eq!(events.last().map(|e| e.stage), Some(Stage::Error));
    }

    #[tokio::test]
    async fn test_delegation_through_task_tool_writes_report() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockModelService::scripted([
            r#"{"action":"tool","tool":"task","input":{"agentRole":"writer","prompt":"summarise","writePath":"output/summary.md"}}"#,
            "# Summary\n\nEverything is fine.",
            r#"{"action":"answer","answer":"Summary written."}"#,
            "Summary written to output/summary.md.",
        ]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = planner(&dir, &mock, 6)
            .run(request(&dir, "have a writer summarise things"), Some(tx), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.text(), Some("Summary written to output/summary.md."));
        let written = std::fs::read_to_string(dir.path().join("output/summary.md")).unwrap();
        assert!(written.starts_with("# Summary"));
        let subagent: Vec<ProgressEvent> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.stage == Stage::Subagent)
            .collect();
        assert!(!subagent.is_empty());
        assert_eq!(subagent.last().unwrap().payload.as_ref().unwrap()["status"], "completed");
    }

    #[tokio::test]
    async fn test_source_file_in_request_is_not_the_save_target() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockModelService::scripted([
            r#"{"action":"answer","answer":"draft"}"#,
            "Main summary.",
        ]));
        let outcome = planner(&dir, &mock, 1)
            .run(
                request(&dir, "summarize src/main.rs and save it as a report"),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let AgentOutcome::Answered { saved_path, .. } = outcome else {
            panic!("expected an answer, not a clarification");
        };
        let saved = saved_path.unwrap();
        assert!(saved.starts_with("/mnt/workspace/output/summarize-src-main-rs"), "{}", saved);
        assert_eq!(output_files(&dir).len(), 1);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_repeated_failures_stop_planning_early() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockModelService::scripted([
            r#"{"action":"tool","tool":"exec","input":{"command":"python a.py"}}"#,
            r#"{"action":"tool","tool":"exec","input":{"command":"python b.py"}}"#,
            "gave up",
        ]));
        let outcome = planner(&dir, &mock, 6)
            .run(request(&dir, "run the scripts"), None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            AgentOutcome::Answered {
                text: "gave up".into(),
                saved_path: None,
                steps: 2,
            }
        );
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_conflict_on_other_file_does_not_escalate() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("output")).unwrap();
        std::fs::write(dir.path().join("output/other.md"), "keep me").unwrap();
        let mock = Arc::new(MockModelService::scripted([
            r#"{"action":"tool","tool":"write_file","input":{"path":"output/other.md","content":"x"}}"#,
            r#"{"action":"tool","tool":"write_file","input":{"path":"output/report.md","content":"fresh"}}"#,
            r#"{"action":"answer","answer":"done"}"#,
            "Report saved.",
        ]));
        let outcome = planner(&dir, &mock, 6)
            .run(
                request(&dir, "write the summary to output/report.md"),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            AgentOutcome::Answered {
                text: "Report saved.".into(),
                saved_path: Some("/mnt/workspace/output/report.md".into()),
                steps: 2,
            }
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("output/other.md")).unwrap(),
            "keep me"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("output/report.md")).unwrap(),
            "fresh"
        );
    }
}
