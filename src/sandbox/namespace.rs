use super::{stdlib, Console, HostError};
use crate::artifacts::codec::{Exporter, ImageCodec};
use crate::artifacts::collector::{Collector, SelectionPolicy};
use crate::artifacts::ImageCandidate;
use crate::bindings::{register_optional, BindingContext, Capabilities};
use rhai::{Dynamic, Engine, FnPtr, Scope, AST};
use std::path::PathBuf;
use std::rc::Rc;

/// Variables every snippet starts with, all unit.
pub const SEEDED_VARIABLES: [&str; 6] = ["result", "image", "images", "img", "fig", "figure"];

pub struct NamespaceSettings {
    pub workdir: PathBuf,
    pub caller_dir: PathBuf,
    pub output_path: Option<PathBuf>,
    pub caps: Capabilities,
}

/// One snippet's interpreter and variable bindings. Variables defined at
/// the top level of the snippet stay in the scope after it runs.
pub struct Namespace {
    engine: Engine,
    scope: Scope<'static>,
    ast: Option<AST>,
    bindings: BindingContext,
    caps: Capabilities,
}

impl Namespace {
    pub fn new(settings: NamespaceSettings, console: &Console) -> Self {
        let mut engine = Engine::new();

        let out = console.clone();
        engine.on_print(move |text| out.out(text));
        let err = console.clone();
        engine.on_debug(move |text, _source, _pos| err.err(text));
        let err = console.clone();
        engine.register_fn("eprint", move |value: Dynamic| {
            if value.is_string() {
                err.err(&value.into_string().unwrap_or_default());
            } else {
                err.err(&value.to_string());
            }
        });

        let workdir = Rc::new(settings.workdir);
        stdlib::register(&mut engine, &workdir);
        let bindings = BindingContext::new(workdir.clone());
        register_optional(&mut engine, &settings.caps, &bindings);

        let mut scope = Scope::new();
        for name in SEEDED_VARIABLES {
            scope.push_dynamic(name, Dynamic::UNIT);
        }
        let workdir_text = workdir.display().to_string();
        scope.push_constant("OUTPUT_DIR", workdir_text.clone());
        scope.push_constant("WORKDIR", workdir_text);
        scope.push_constant_dynamic(
            "OUTPUT_PATH",
            settings
                .output_path
                .map_or(Dynamic::UNIT, |p| Dynamic::from(p.display().to_string())),
        );
        scope.push_constant("CWD", settings.caller_dir.display().to_string());

        Self {
            engine,
            scope,
            ast: None,
            bindings,
            caps: settings.caps,
        }
    }

    /// Compile and run `code`. Source starting with `return` that fails to
    /// parse is retried as an assignment to `result`; source starting with
    /// `return` that runs binds the returned value to `result`.
    pub fn execute(&mut self, code: &str) -> Result<(), HostError> {
        let ast = match self.engine.compile_with_scope(&self.scope, code) {
            Ok(ast) => ast,
            Err(parse_error) => {
                let Some(rewritten) = return_as_assignment(code) else {
                    return Err(HostError::Syntax(parse_error.to_string()));
                };
                tracing::debug!(error = %parse_error, "retrying leading return as assignment to result");
                self.engine
                    .compile_with_scope(&self.scope, &rewritten)
                    .map_err(|e| HostError::Syntax(e.to_string()))?
            }
        };

        let outcome = self.engine.eval_ast_with_scope::<Dynamic>(&mut self.scope, &ast);
        self.ast = Some(ast);
        let value = outcome.map_err(|e| HostError::Runtime(e.to_string()))?;

        if starts_with_return(code) && !value.is_unit() && self.result().is_unit() {
            self.scope.set_value("result", value);
        }
        Ok(())
    }

    pub fn scope(&self) -> &Scope<'static> {
        &self.scope
    }

    /// The `result` binding, unit if never assigned.
    pub fn result(&self) -> Dynamic {
        self.scope
            .get_value::<Dynamic>("result")
            .map(|value| value.flatten())
            .unwrap_or(Dynamic::UNIT)
    }

    /// Capture images from variables, open figures and the working
    /// directory. Open figures are closed.
    pub fn collect_images(&self, policy: &SelectionPolicy) -> Vec<ImageCandidate> {
        let codec = ImageCodec::new(self.caps).with_exporter(self);
        #[allow(unused_mut)]
        let mut collector = Collector::new(codec, &self.bindings.workdir);
        #[cfg(feature = "plotting")]
        if self.caps.plot {
            collector = collector.with_plots(&self.bindings.plots);
        }
        collector.harvest(&self.scope, policy)
    }
}

impl Exporter for Namespace {
    fn export(&self, function: &FnPtr) -> Result<Dynamic, String> {
        let ast = self
            .ast
            .as_ref()
            .ok_or_else(|| "no script has been run".to_string())?;
        function
            .call::<Dynamic>(&self.engine, ast, ())
            .map_err(|e| e.to_string())
    }
}

fn starts_with_return(code: &str) -> bool {
    let trimmed = code.trim_start();
    trimmed.strip_prefix("return").is_some_and(|rest| {
        !rest.starts_with(|c: char| c.is_alphanumeric() || c == '_')
    })
}

/// `return <expr>` becomes `result = <expr>`.
fn return_as_assignment(code: &str) -> Option<String> {
    let trimmed = code.trim();
    let expression = trimmed.strip_prefix("return")?;
    if !expression.starts_with(char::is_whitespace) {
        return None;
    }
    let expression = expression.trim();
    if expression.is_empty() {
        return None;
    }
    Some(format!("result = {expression}"))
}
