//! Script environment injected before plugin code.
//!
//! QuickJS ships a bare ECMAScript global scope. The bundle below adds the
//! browser-ish surface plugins expect, evaluated in a fixed order because
//! later pieces build on earlier ones (`Blob` needs the codec, `fetch` needs
//! `Headers`, the adapter needs everything).

use crate::config::{PromiseMode, RuntimeConfig};
use crate::engine::Engine;
use crate::error::{RuntimeError, RuntimeResult};
use crate::services::ScriptModule;

/// One piece of the bundle.
pub struct Polyfill {
    pub name: &'static str,
    pub source: &'static str,
}

const INTERNALS: Polyfill = Polyfill {
    name: "internals",
    source: include_str!("js/internals.js"),
};

/// Pieces evaluated after the internal namespace is configured.
pub const POLYFILLS: &[Polyfill] = &[
    Polyfill { name: "console", source: include_str!("js/console.js") },
    Polyfill { name: "url", source: include_str!("js/url.js") },
    Polyfill { name: "headers", source: include_str!("js/headers.js") },
    Polyfill { name: "text_encoding", source: include_str!("js/text_encoding.js") },
    Polyfill { name: "blob", source: include_str!("js/blob.js") },
    Polyfill { name: "dom", source: include_str!("js/dom.js") },
    Polyfill { name: "promise", source: include_str!("js/promise.js") },
    Polyfill { name: "scheduler", source: include_str!("js/scheduler.js") },
    Polyfill { name: "form_data", source: include_str!("js/form_data.js") },
    Polyfill { name: "base64", source: include_str!("js/base64.js") },
    Polyfill { name: "fetch", source: include_str!("js/fetch.js") },
    Polyfill { name: "modules", source: include_str!("js/modules.js") },
    Polyfill { name: "adapter", source: include_str!("js/adapter.js") },
];

/// Settings object passed to `__folio.configure`.
fn settings(config: &RuntimeConfig) -> serde_json::Value {
    let mut settings = config.script_settings();
    settings["emulatePromise"] = serde_json::Value::Bool(config.promise_mode == PromiseMode::Emulated);
    settings
}

/// Evaluate the whole bundle, then register host-provided modules.
///
/// Errors name the failing stage as `installing <piece>`.
pub fn install(engine: &Engine, config: &RuntimeConfig, modules: &[ScriptModule]) -> RuntimeResult<()> {
    evaluate_piece(engine, &INTERNALS)?;

    let configure = format!("__folio.configure({});", settings(config));
    engine
        .evaluate(&configure)
        .map_err(|e| stage_error("installing settings", e))?;

    for polyfill in POLYFILLS {
        evaluate_piece(engine, polyfill)?;
    }

    for module in modules {
        define_module(engine, module).map_err(|e| stage_error(&format!("installing module {}", module.name), e))?;
    }

    tracing::debug!(
        "[environment:{}] Installed {} polyfills and {} host modules",
        engine.name(),
        POLYFILLS.len() + 1,
        modules.len()
    );
    Ok(())
}

fn evaluate_piece(engine: &Engine, polyfill: &Polyfill) -> RuntimeResult<()> {
    engine
        .evaluate_script(polyfill.name, polyfill.source)
        .map(|_| ())
        .map_err(|e| stage_error(&format!("installing {}", polyfill.name), e))
}

fn define_module(engine: &Engine, module: &ScriptModule) -> RuntimeResult<()> {
    let name = serde_json::to_string(&module.name)?;
    let source = format!(
        "__folio.defineModule({}, function (module, exports, require) {{\n{}\n}});",
        name, module.source
    );
    engine.evaluate_script(&module.name, &source).map(|_| ())
}

/// Prefix the failing stage; the loader wraps the result into `PluginLoad`.
fn stage_error(stage: &str, cause: RuntimeError) -> RuntimeError {
    RuntimeError::ScriptEvaluation {
        message: format!("{}: {}", stage, describe(&cause)),
        stack: match &cause {
            RuntimeError::ScriptEvaluation { stack, .. } => stack.clone(),
            _ => String::new(),
        },
    }
}

fn describe(cause: &RuntimeError) -> String {
    match cause {
        RuntimeError::ScriptEvaluation { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineLimits, ScriptValue};
    use crate::ops::{register_host_ops, HostState};

    fn environment(config: &RuntimeConfig) -> Engine {
        let mut engine = Engine::new("env", EngineLimits::from(config));
        engine.initialize().unwrap();
        register_host_ops(&engine, &HostState::shared(config.max_pending_fetches)).unwrap();
        install(&engine, config, &[]).unwrap();
        engine
    }

    fn pumped(engine: &Engine) {
        for _ in 0..8 {
            engine.run_pending_jobs().unwrap();
            engine.evaluate("__folio.pump()").unwrap();
        }
    }

    fn text(engine: &Engine, source: &str) -> String {
        match engine.evaluate(source).unwrap() {
            ScriptValue::String(s) => s,
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn test_internals_are_hidden_from_enumeration() {
        let engine = environment(&RuntimeConfig::default());
        let value = engine
            .evaluate("Object.keys(globalThis).indexOf('__folio') === -1 && typeof __folio.pump === 'function'")
            .unwrap();
        assert_eq!(value, ScriptValue::Bool(true));
    }

    #[test]
    fn test_console_capture() {
        let engine = environment(&RuntimeConfig::default());
        engine
            .evaluate("console.log('hello', 3, {a: 1}); console.error(new TypeError('bad'));")
            .unwrap();

        assert_eq!(text(&engine, "__lastLog"), "hello 3 {\"a\":1}");
        assert_eq!(text(&engine, "__lastError"), "TypeError: bad");
    }

    #[test]
    fn test_url_resolution() {
        let engine = environment(&RuntimeConfig::default());

        assert_eq!(
            text(&engine, "new URL('../b/c?x=1#top', 'https://Example.com:443/a/d/e').href"),
            "https://example.com/a/b/c?x=1#top"
        );
        assert_eq!(text(&engine, "new URL('//cdn.test/img.png', 'https://a.test/p').href"), "https://cdn.test/img.png");
        assert_eq!(text(&engine, "new URL('?page=2', 'https://a.test/list?page=1').href"), "https://a.test/list?page=2");
        assert_eq!(
            text(&engine, "var u = new URL('https://a.test/s'); u.searchParams.append('q', 'a b'); u.href"),
            "https://a.test/s?q=a+b"
        );
        assert_eq!(
            text(&engine, "String(new URLSearchParams('a=1&b=%20x&a=2').getAll('a'))"),
            "1,2"
        );
        assert_eq!(
            engine.evaluate("URL.canParse('not a url')").unwrap(),
            ScriptValue::Bool(false)
        );
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let engine = environment(&RuntimeConfig::default());
        engine
            .evaluate("var h = new Headers({'Content-Type': 'text/html'}); h.append('X-Multi', 'a'); h.append('x-multi', 'b');")
            .unwrap();

        assert_eq!(text(&engine, "h.get('CONTENT-TYPE')"), "text/html");
        assert_eq!(text(&engine, "h.get('X-MULTI')"), "a, b");
        assert_eq!(engine.evaluate("h.get('missing')").unwrap(), ScriptValue::Null);
        assert_eq!(engine.evaluate("h.has('x-Multi')").unwrap(), ScriptValue::Bool(true));
    }

    #[test]
    fn test_utf8_codec() {
        let engine = environment(&RuntimeConfig::default());

        assert_eq!(
            engine
                .evaluate("Array.from(new TextEncoder().encode('é€😀')).join(',')")
                .unwrap(),
            ScriptValue::String("195,169,226,130,172,240,159,152,128".to_string())
        );
        assert_eq!(
            text(&engine, "new TextDecoder().decode(new TextEncoder().encode('héllo 😀'))"),
            "héllo 😀"
        );
        assert_eq!(
            text(&engine, "new TextDecoder().decode(new Uint8Array([0x61, 0xff, 0xc3]))"),
            "a\u{fffd}\u{fffd}"
        );
    }

    #[test]
    fn test_base64_and_form_data() {
        let engine = environment(&RuntimeConfig::default());

        assert_eq!(text(&engine, "btoa('folio!')"), "Zm9saW8h");
        assert_eq!(text(&engine, "atob('Zm9saW8h')"), "folio!");
        assert_eq!(
            text(&engine, "var f = new FormData(); f.append('q', 'a&b'); f.append('p', '2'); f.toString()"),
            "q=a%26b&p=2"
        );
    }

    #[test]
    fn test_dom_parser_builds_queryable_tree() {
        let engine = environment(&RuntimeConfig::default());
        engine
            .evaluate(
                r#"
                var doc = new DOMParser().parseFromString(
                  '<html><head><title>T &amp; U</title></head><body>' +
                  '<ul id="list"><li class="item a"><a href="/n/1">One</a><li class="item"><a href="/n/2">Two</a></ul>' +
                  '<img src="c.png"><p>x<br>y</p></body></html>', 'text/html');
                "#,
            )
            .unwrap();

        assert_eq!(text(&engine, "doc.title"), "T & U");
        assert_eq!(
            text(&engine, "doc.querySelectorAll('#list > li.item a').map(function (a) { return a.getAttribute('href'); }).join(',')"),
            "/n/1,/n/2"
        );
        assert_eq!(text(&engine, "doc.querySelector('li.a').textContent"), "One");
        assert_eq!(text(&engine, "doc.querySelector('img[src$=\".png\"]').src"), "c.png");
        assert_eq!(text(&engine, "doc.querySelector('p').innerHTML"), "x<br>y");

        engine
            .evaluate("var el = document.createElement('div'); el.setAttribute('data-k', 'v'); el.appendChild(document.createTextNode('hi'));")
            .unwrap();
        assert_eq!(text(&engine, "el.outerHTML"), "<div data-k=\"v\">hi</div>");
    }

    #[test]
    fn test_promise_handler_ordering() {
        let engine = environment(&RuntimeConfig::default());
        engine
            .evaluate(
                r#"
                var order = [];
                var p = new Promise(function (resolve) { order.push('executor'); resolve(1); });
                p.then(function () { order.push('a'); });
                p.then(function () { order.push('b'); }).then(function () { order.push('d'); });
                p.then(function () { order.push('c'); });
                order.push('sync');
                "#,
            )
            .unwrap();

        assert_eq!(text(&engine, "order.join(',')"), "executor,sync");
        pumped(&engine);
        assert_eq!(text(&engine, "order.join(',')"), "executor,sync,a,b,c,d");
    }

    #[test]
    fn test_promise_self_resolution_rejects() {
        let engine = environment(&RuntimeConfig::default());
        engine
            .evaluate(
                r#"
                var seen = null;
                var resolveLater;
                var p = new Promise(function (resolve) { resolveLater = resolve; });
                resolveLater(p);
                p.catch(function (e) { seen = (e instanceof TypeError) + ':' + e.message; });
                "#,
            )
            .unwrap();
        pumped(&engine);

        assert_eq!(text(&engine, "seen"), "true:Chaining cycle detected for promise");
    }

    #[test]
    fn test_promise_combinators_and_thenables() {
        let engine = environment(&RuntimeConfig::default());
        engine
            .evaluate(
                r#"
                var out = {};
                Promise.all([1, Promise.resolve(2), { then: function (r) { r(3); } }])
                  .then(function (v) { out.all = v.join('+'); });
                Promise.race([new Promise(function () {}), Promise.reject(new Error('fast'))])
                  .catch(function (e) { out.race = e.message; });
                Promise.allSettled([Promise.reject('x'), 5])
                  .then(function (r) { out.settled = r.map(function (e) { return e.status; }).join(','); });
                Promise.resolve(1).finally(function () { out.fin = true; });
                "#,
            )
            .unwrap();
        pumped(&engine);

        assert_eq!(text(&engine, "out.all"), "1+2+3");
        assert_eq!(text(&engine, "out.race"), "fast");
        assert_eq!(text(&engine, "out.settled"), "rejected,fulfilled");
        assert_eq!(engine.evaluate("out.fin").unwrap(), ScriptValue::Bool(true));
    }

    #[test]
    fn test_native_promise_mode_keeps_engine_promise() {
        let config = RuntimeConfig::default().with_promise_mode(PromiseMode::Native);
        let engine = environment(&config);

        assert_eq!(
            engine.evaluate("Promise === __folio.NativePromise && Promise !== __folio.Promise").unwrap(),
            ScriptValue::Bool(true)
        );
    }

    #[test]
    fn test_timer_delays() {
        let config = RuntimeConfig::default().with_max_timer_delay(std::time::Duration::from_millis(1_000));
        let engine = environment(&config);
        engine
            .evaluate(
                r#"
                var fired = [];
                setTimeout(function () { fired.push('zero'); }, 0);
                setTimeout(function () { fired.push('late'); }, 5000);
                var cancelled = setTimeout(function () { fired.push('cancelled'); }, 0);
                clearTimeout(cancelled);
                setTimeout(function (tag) { fired.push(tag); }, 20, 'short');
                "#,
            )
            .unwrap();

        engine.evaluate("__folio.pump()").unwrap();
        assert_eq!(text(&engine, "fired.join(',')"), "zero");

        std::thread::sleep(std::time::Duration::from_millis(40));
        engine.evaluate("__folio.pump()").unwrap();
        assert_eq!(text(&engine, "fired.join(',')"), "zero,short");
        // The over-limit timer was never queued.
        assert_eq!(engine.evaluate("__folio.pendingTimers()").unwrap(), ScriptValue::Number(0.0));
    }

    #[test]
    fn test_intervals_repeat_until_cleared() {
        let engine = environment(&RuntimeConfig::default());
        engine
            .evaluate("var ticks = 0; var h = setInterval(function () { ticks++; if (ticks === 2) clearInterval(h); }, 5);")
            .unwrap();

        for _ in 0..10 {
            std::thread::sleep(std::time::Duration::from_millis(10));
            engine.evaluate("__folio.pump()").unwrap();
        }
        assert_eq!(engine.evaluate("ticks").unwrap(), ScriptValue::Number(2.0));
    }

    #[test]
    fn test_require_registry() {
        let config = RuntimeConfig::default();
        let mut engine = Engine::new("env", EngineLimits::from(&config));
        engine.initialize().unwrap();
        register_host_ops(&engine, &HostState::shared(4)).unwrap();
        install(
            &engine,
            &config,
            &[ScriptModule::new("greeting", "module.exports = { hello: function (n) { return 'hi ' + n; } };")],
        )
        .unwrap();

        assert_eq!(text(&engine, "require('greeting').hello('there')"), "hi there");
        assert_eq!(text(&engine, "require('@libs/filterInputs').FilterTypes.CheckboxGroup"), "Checkbox");
        assert_eq!(
            engine.evaluate("require('@libs/isAbsoluteUrl').isUrlAbsolute('https://a.test')").unwrap(),
            ScriptValue::Bool(true)
        );
        match engine.evaluate("require('cheerio')") {
            Err(RuntimeError::ScriptEvaluation { message, .. }) => {
                assert!(message.contains("Module not found: cheerio"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_broken_module_names_stage() {
        let config = RuntimeConfig::default();
        let mut engine = Engine::new("env", EngineLimits::from(&config));
        engine.initialize().unwrap();
        register_host_ops(&engine, &HostState::shared(4)).unwrap();

        let err = install(&engine, &config, &[ScriptModule::new("broken", "function (")]).unwrap_err();
        assert!(err.to_string().contains("installing module broken"));
    }
}
