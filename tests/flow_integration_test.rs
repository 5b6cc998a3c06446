//! Flow 集成测试：顺序阶段、上下文传递、阶段失败中止

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;

use hive::config::AgentConfig;
use hive::core::{AgentError, FinishReason};
use hive::flow::{FlowBuilder, FlowContext, FlowError, StageSpec};
use hive::memory::Role;
use hive::react::{last_user_message, Agent, FnStrategy, Intent, IntentContext, ScriptedStrategy};
use hive::tools::builtin_tools;

/// 每个阶段把收到的输入加上阶段名前缀后 finish；记录构建过的阶段与收到的输入
#[derive(Default)]
struct Recorder {
    built: AtomicUsize,
    inputs: Mutex<Vec<(String, String)>>,
}

fn prefixing_agent(stage: &StageSpec, recorder: Arc<Recorder>) -> Result<Agent, AgentError> {
    recorder.built.fetch_add(1, Ordering::SeqCst);
    let name = stage.name.clone();
    let strategy = FnStrategy::new(move |ctx: &IntentContext<'_>| {
        let input = last_user_message(ctx.memory).unwrap_or_default().to_string();
        recorder.inputs.lock().unwrap().push((name.clone(), input.clone()));
        Ok(Intent::call("finish", json!({ "output": format!("[{}] {}", name, input) })))
    });
    Agent::new(stage.config.clone(), Arc::new(strategy), builtin_tools())
}

#[tokio::test]
async fn flow_passes_context_between_stages() {
    let recorder = Arc::new(Recorder::default());
    let rec = Arc::clone(&recorder);
    let flow = FlowBuilder::new("pipeline")
        .stage("research", AgentConfig::default())
        .stage("draft", AgentConfig::default())
        .output_key("text")
        .stage("publish", AgentConfig::default())
        .inputs(["input", "research"])
        .instruction("Publish it.")
        .factory(move |stage: &StageSpec| prefixing_agent(stage, Arc::clone(&rec)))
        .build()
        .unwrap();

    let outcome = flow.run_flow(FlowContext::with_input("topic")).await.unwrap();

    assert_eq!(outcome.context.keys(), vec!["input", "research", "text", "publish"]);
    assert_eq!(outcome.context.get_str("research"), Some("[research] topic"));
    assert_eq!(outcome.context.get_str("text"), Some("[draft] [research] topic"));

    let inputs = recorder.inputs.lock().unwrap().clone();
    assert_eq!(inputs[2].0, "publish");
    assert_eq!(
        inputs[2].1,
        "Publish it.\n\n[draft] [research] topic\n\ninput: topic\nresearch: [research] topic"
    );

    assert_eq!(outcome.audit.len(), 3);
    assert_eq!(outcome.audit[1].output_key, "text");
    assert!(outcome
        .audit
        .iter()
        .all(|a| a.reason == FinishReason::TerminalTool("finish".to_string())));
    assert_eq!(outcome.final_output(), outcome.context.get_str("publish"));
}

#[tokio::test]
async fn scenario_flow_halts_on_failed_stage() {
    let built = Arc::new(Mutex::new(Vec::<String>::new()));
    let log = Arc::clone(&built);
    let factory = move |stage: &StageSpec| -> Result<Agent, AgentError> {
        log.lock().unwrap().push(stage.name.clone());
        let strategy: Arc<dyn hive::react::IntentStrategy> = match stage.name.as_str() {
            "draft" => Arc::new(
                ScriptedStrategy::default()
                    .then(Intent::call("echo", json!({"text": "thinking"})))
                    .then_error(AgentError::Llm("model unavailable".to_string())),
            ),
            _ => Arc::new(ScriptedStrategy::new([Intent::call(
                "finish",
                json!({"output": "stage output"}),
            )])),
        };
        Agent::new(stage.config.clone(), strategy, builtin_tools())
    };

    let flow = FlowBuilder::new("fragile")
        .stage("research", AgentConfig::default())
        .stage("draft", AgentConfig::default())
        .stage("publish", AgentConfig::default())
        .factory(factory)
        .build()
        .unwrap();

    let err = flow.run_flow(FlowContext::with_input("topic")).await.unwrap_err();
    match err {
        FlowError::StageFailed {
            stage,
            index,
            error,
            audit,
            failed_trace,
        } => {
            assert_eq!(stage, "draft");
            assert_eq!(index, 1);
            assert_eq!(error, AgentError::Llm("model unavailable".to_string()));
            assert_eq!(audit.len(), 1);
            assert_eq!(audit[0].stage, "research");
            assert_eq!(audit[0].output, "stage output");
            assert_eq!(failed_trace[0].role, Role::User);
            assert_eq!(failed_trace[0].content, "stage output");
            assert!(failed_trace.iter().any(|m| m.tool_name() == Some("echo")));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(*built.lock().unwrap(), vec!["research", "draft"]);
}

#[tokio::test]
async fn stage_agents_take_the_stage_name() {
    let names = Arc::new(Mutex::new(Vec::<String>::new()));
    let log = Arc::clone(&names);
    let flow = FlowBuilder::new("named")
        .stage("alpha", AgentConfig::default())
        .stage("beta", AgentConfig::named("custom"))
        .factory(move |stage: &StageSpec| {
            log.lock().unwrap().push(stage.config.name.clone());
            Agent::new(
                stage.config.clone(),
                Arc::new(ScriptedStrategy::default()),
                builtin_tools(),
            )
        })
        .build()
        .unwrap();
    flow.run_flow(FlowContext::with_input("x")).await.unwrap();
    assert_eq!(*names.lock().unwrap(), vec!["alpha", "custom"]);
}

#[tokio::test]
async fn cancelled_flow_runs_no_stage() {
    let recorder = Arc::new(Recorder::default());
    let rec = Arc::clone(&recorder);
    let flow = FlowBuilder::new("cancelled")
        .stage("only", AgentConfig::default())
        .factory(move |stage: &StageSpec| prefixing_agent(stage, Arc::clone(&rec)))
        .build()
        .unwrap();
    flow.cancel();

    let err = flow.run_flow(FlowContext::with_input("x")).await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::StageFailed { index: 0, error: AgentError::Cancelled, .. }
    ));
    assert_eq!(recorder.built.load(Ordering::SeqCst), 0);
}
