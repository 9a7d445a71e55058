//! Static Magic-Script documentation served by the knowledge tools.
//!
//! Everything here is loaded once and never mutated. Entries are compact
//! working notes for an agent writing Magic-API interfaces, not a mirror of
//! the upstream documentation set.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct KnowledgeEntry {
    pub topic: &'static str,
    pub title: &'static str,
    pub summary: &'static str,
    pub sections: BTreeMap<&'static str, &'static str>,
    pub source_doc: &'static str,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScriptExample {
    pub kind: &'static str,
    pub title: &'static str,
    pub code: &'static str,
    pub notes: &'static str,
}

#[derive(Clone, Debug, Serialize)]
pub struct Workflow {
    pub task: &'static str,
    pub description: &'static str,
    pub steps: &'static [&'static str],
    pub commands: &'static [&'static str],
}

#[derive(Clone, Debug, Serialize)]
pub struct DocSection {
    pub id: &'static str,
    pub title: &'static str,
    pub topics: &'static [&'static str],
}

static SYNTAX_TOPICS: LazyLock<BTreeMap<&'static str, KnowledgeEntry>> = LazyLock::new(|| {
    let mut topics = BTreeMap::new();
    topics.insert(
        "basic",
        KnowledgeEntry {
            topic: "basic",
            title: "Magic-Script language basics",
            summary: "Core syntax: dynamic typing, var declarations, control flow, lambdas.",
            sections: BTreeMap::from([
                (
                    "variables",
                    "Declare with `var name = expr;`. Types are dynamic; integers, \
                     decimals, strings, booleans, lists `[1, 2, 3]` and maps \
                     `{key: value}` are built in.",
                ),
                (
                    "control_flow",
                    "`if`/`else if`/`else` and `for item in collection` as in Java-like \
                     languages. `for (index, item) in list` exposes the position. Loops \
                     support `break` and `continue`.",
                ),
                (
                    "lambdas",
                    "Arrow syntax: `var double = (value) => value * 2;`. Collections \
                     expose `map`, `filter`, `each`, `sort` taking lambdas.",
                ),
                (
                    "return_value",
                    "The last expression of a script is its response body. Use \
                     `return` to exit early; `exit 400, 'message'` aborts with an \
                     explicit HTTP status.",
                ),
            ]),
            source_doc: "script-basics.md",
        },
    );
    topics.insert(
        "db",
        KnowledgeEntry {
            topic: "db",
            title: "Database module",
            summary: "The `db` module runs SQL with named parameter binding, pagination, \
                      transactions, and datasource selection.",
            sections: BTreeMap::from([
                (
                    "query",
                    "`db.select(sql)` returns a list of rows, `db.selectOne` a single \
                     row map, `db.selectInt`/`db.selectValue` scalars. \
                     `db.page(sql)` applies the request's page parameters and returns \
                     `{total, list}`.",
                ),
                (
                    "parameter_placeholders",
                    "SQL parameters MUST use the `#{ }` placeholder form, e.g. \
                     `select * from sys_user where id = #{id}`; values bind as \
                     prepared-statement parameters. `${ }` performs raw string \
                     interpolation into the SQL text and is reserved for structural \
                     fragments (table or column names); passing user input through \
                     `${ }` is an SQL injection hole.",
                ),
                (
                    "write",
                    "`db.insert(sql)`, `db.update(sql)`, `db.delete(sql)` return \
                     affected-row counts. `db.insert` returns the generated key when \
                     the table has one.",
                ),
                (
                    "transaction",
                    "`db.transaction(() => { ... })` commits when the lambda returns \
                     and rolls back on any thrown error. Nested calls join the outer \
                     transaction.",
                ),
                (
                    "datasource",
                    "`db.slave.select(...)` targets the datasource registered under \
                     the key `slave`; omitting the key uses the primary datasource.",
                ),
            ]),
            source_doc: "db-module.md",
        },
    );
    topics.insert(
        "http",
        KnowledgeEntry {
            topic: "http",
            title: "Request handling and the http module",
            summary: "Reading request input inside an interface, and calling external \
                      services with the `http` module.",
            sections: BTreeMap::from([
                (
                    "parameters",
                    "Query and form parameters are injected as script variables by \
                     name. Path variables declared as `/user/{id}` arrive the same \
                     way. `request.getParameter(name)` reads one explicitly.",
                ),
                (
                    "body",
                    "A JSON request body is available as the `body` variable; nested \
                     fields are plain map/list access, e.g. `body.user.name`.",
                ),
                (
                    "headers",
                    "`request.getHeader('x-token')` reads a header. Client metadata \
                     such as the calling IP is on `request` as well.",
                ),
                (
                    "outbound",
                    "`http.connect(url).get()`/`.post()` issue outbound calls; chain \
                     `.header(k, v)`, `.param(k, v)`, `.body(value)` before the verb. \
                     The response exposes `.getBody()` and `.getCode()`.",
                ),
            ]),
            source_doc: "request-and-http.md",
        },
    );
    topics.insert(
        "response",
        KnowledgeEntry {
            topic: "response",
            title: "Response module",
            summary: "Shaping interface output beyond the default JSON envelope.",
            sections: BTreeMap::from([
                (
                    "envelope",
                    "By default the service wraps results as \
                     `{code: 1, message: 'success', data: <script result>}`. Return \
                     plain values and let the wrapper apply.",
                ),
                (
                    "explicit",
                    "`response.json(value)` bypasses the wrapper; `response.page(total, \
                     list)` emits the standard pagination shape; `response.text(str)` \
                     sends text/plain.",
                ),
                (
                    "errors",
                    "`exit code, message` (e.g. `exit 0, 'not allowed'`) produces an \
                     envelope with that code and no data; unhandled script errors \
                     surface as `code: -1` with the exception message.",
                ),
            ]),
            source_doc: "response-module.md",
        },
    );
    topics.insert(
        "module",
        KnowledgeEntry {
            topic: "module",
            title: "Built-in modules and import",
            summary: "Module system: `db`, `http`, `request`, `response`, `env`, `log`, \
                      and importing Java classes.",
            sections: BTreeMap::from([
                (
                    "builtin",
                    "`db`, `http`, `request`, `response`, `env`, and `log` are \
                     importable by name: `import log;`. `log.info(...)` writes to the \
                     service log and streams to attached console sessions.",
                ),
                (
                    "java_interop",
                    "`import 'java.time.LocalDate' as LocalDate;` binds a Java class; \
                     static and instance calls use plain method syntax.",
                ),
                (
                    "env",
                    "`env.get('key')` reads service configuration values registered \
                     with the runtime.",
                ),
            ]),
            source_doc: "modules.md",
        },
    );
    topics
});

static EXAMPLES: LazyLock<Vec<ScriptExample>> = LazyLock::new(|| {
    vec![
        ScriptExample {
            kind: "basic",
            title: "Echo a query parameter",
            code: "var name = request.getParameter('name');\nreturn 'hello, ' + (name == null ? 'world' : name);",
            notes: "Query parameters are also injected as variables when declared in the interface definition.",
        },
        ScriptExample {
            kind: "basic",
            title: "Transform a list with a lambda",
            code: "var values = [1, 2, 3, 4];\nreturn values.filter(v => v % 2 == 0).map(v => v * 10);",
            notes: "Collection operators accept arrow lambdas.",
        },
        ScriptExample {
            kind: "db",
            title: "Select with a bound parameter",
            code: "return db.select('select id, name from sys_user where dept_id = #{deptId}');",
            notes: "`deptId` binds from the request parameter of the same name via #{ }.",
        },
        ScriptExample {
            kind: "db",
            title: "Paginated query",
            code: "return db.page('select id, name from sys_user order by id');",
            notes: "Page index and size come from the request's standard paging parameters.",
        },
        ScriptExample {
            kind: "db",
            title: "Insert inside a transaction",
            code: "return db.transaction(() => {\n    var id = db.insert('insert into sys_user(name) values(#{body.name})');\n    db.update('update dept set user_count = user_count + 1 where id = #{body.deptId}');\n    return id;\n});",
            notes: "The lambda's return value is the transaction result; any thrown error rolls back.",
        },
        ScriptExample {
            kind: "http",
            title: "Call an external service",
            code: "import http;\nvar resp = http.connect('https://httpbin.org/get')\n    .param('q', 'magic')\n    .get();\nreturn resp.getBody();",
            notes: "Outbound calls go through the http module; the interface response wraps the returned body.",
        },
    ]
});

static BEST_PRACTICES: &[&str] = &[
    "Bind every user-supplied SQL value with #{ } placeholders; never concatenate input into SQL or pass it through ${ }.",
    "Keep one interface per responsibility and group related interfaces under a shared path prefix.",
    "Wrap multi-statement writes in db.transaction so partial failures roll back.",
    "Return plain values and let the standard envelope wrap them; reach for response.json only when the shape must deviate.",
    "Use log.info/log.warn around external calls so console sessions can trace request flow.",
    "Validate required parameters at the top of the script and `exit 400, ...` early on bad input.",
];

static PITFALLS: &[&str] = &[
    "${ } interpolates raw text into SQL; using it for values instead of #{ } is an injection hole and breaks on quotes.",
    "db.selectOne returns null when no row matches; field access on the result then throws. Check before dereferencing.",
    "Script variables shadow injected request parameters of the same name; a stray `var id = ...` hides the path variable.",
    "Unsaved editor changes are not live: an interface runs the last saved script, not the buffer.",
    "db.page without an order by produces unstable page boundaries across requests.",
    "exit 1, ... looks like success to callers that only check the envelope code; reserve code 1 for success.",
];

static WORKFLOWS: LazyLock<Vec<Workflow>> = LazyLock::new(|| {
    vec![
        Workflow {
            task: "create_api",
            description: "Create a new interface under an existing group and verify it responds.",
            steps: &[
                "Pick the target group and note its id (resource tree, kind=api).",
                "Create the script file with name, HTTP method, and path under that group.",
                "Write the script body; bind SQL values with #{ } placeholders.",
                "Save, then call the interface and check the envelope code is 1.",
            ],
            commands: &[
                "magicapi_resource_tree {\"kind\": \"api\"}",
                "magicapi_call {\"method\": \"POST\", \"path\": \"/your/new/path\", \"data\": {}}",
            ],
        },
        Workflow {
            task: "debug_api",
            description: "Locate a misbehaving interface, inspect its script, and re-run it while watching logs.",
            steps: &[
                "Resolve the interface id from its request path.",
                "Fetch the script detail and read the current saved body.",
                "Attach a console session to stream log output.",
                "Call the interface with the failing input and correlate the logs.",
            ],
            commands: &[
                "magicapi_path_to_id {\"path\": \"/order/create\"}",
                "magicapi_api_detail {\"file_id\": \"<id>\"}",
                "magicapi_call {\"method\": \"POST\", \"path\": \"/order/create\", \"data\": {\"id\": 1}}",
            ],
        },
        Workflow {
            task: "query_db",
            description: "Answer a data question with an ad-hoc read-only interface.",
            steps: &[
                "Confirm the datasource and table names (topic 'db', section 'datasource').",
                "Draft the select with #{ } placeholders for any runtime input.",
                "Run it via a scratch interface or an existing generic query endpoint.",
                "Page results with db.page when the row count is unbounded.",
            ],
            commands: &[
                "magicapi_syntax {\"topic\": \"db\"}",
                "magicapi_examples {\"kind\": \"db\"}",
            ],
        },
    ]
});

static DOC_INDEX: &[DocSection] = &[
    DocSection {
        id: "language",
        title: "Magic-Script language",
        topics: &["basic", "module"],
    },
    DocSection {
        id: "data-access",
        title: "Database access",
        topics: &["db"],
    },
    DocSection {
        id: "web",
        title: "Request and response handling",
        topics: &["http", "response"],
    },
];

const DOCS_SUMMARY: &str =
    "Magic-API serves HTTP interfaces whose bodies are Magic-Script programs edited \
     live in the service. Scripts read request input through injected variables and \
     the request module, access data through the db module with #{ } parameter \
     binding, and return values that the service wraps in a {code, message, data} \
     envelope. The assistant's knowledge topics cover the language core, the db/http/ \
     response modules, and the module system.";

const SYSTEM_PROMPT: &str =
    "You are a Magic-API development assistant. You help write, locate, and debug \
     Magic-Script interfaces on one Magic-API service. Ground answers in the \
     knowledge tools (syntax, examples, best_practices, pitfalls, workflow) and \
     inspect the live service with resource_tree, path_to_id, api_detail, and call. \
     Always bind SQL values with #{ } placeholders, never ${ }. Prefer small, \
     verifiable steps: resolve the path, read the script, then change or call it.";

pub fn syntax_entry(topic: &str) -> Option<&'static KnowledgeEntry> {
    SYNTAX_TOPICS.get(topic)
}

pub fn syntax_topics() -> Vec<&'static str> {
    SYNTAX_TOPICS.keys().copied().collect()
}

/// Examples for a kind, optionally filtered by a case-insensitive keyword
/// over title, code, and notes.
pub fn examples(kind: &str, keyword: Option<&str>) -> Vec<&'static ScriptExample> {
    let keyword = keyword.map(str::to_ascii_lowercase);
    EXAMPLES
        .iter()
        .filter(|example| example.kind == kind)
        .filter(|example| match &keyword {
            Some(needle) => {
                example.title.to_ascii_lowercase().contains(needle)
                    || example.code.to_ascii_lowercase().contains(needle)
                    || example.notes.to_ascii_lowercase().contains(needle)
            }
            None => true,
        })
        .collect()
}

pub fn example_kinds() -> Vec<&'static str> {
    let mut kinds: Vec<&'static str> = EXAMPLES.iter().map(|example| example.kind).collect();
    kinds.sort_unstable();
    kinds.dedup();
    kinds
}

pub fn best_practices() -> &'static [&'static str] {
    BEST_PRACTICES
}

pub fn pitfalls() -> &'static [&'static str] {
    PITFALLS
}

pub fn workflow(task: &str) -> Option<&'static Workflow> {
    WORKFLOWS.iter().find(|workflow| workflow.task == task)
}

pub fn workflow_tasks() -> Vec<&'static str> {
    WORKFLOWS.iter().map(|workflow| workflow.task).collect()
}

pub fn docs_index() -> &'static [DocSection] {
    DOC_INDEX
}

pub fn docs_summary() -> &'static str {
    DOCS_SUMMARY
}

pub fn system_prompt() -> &'static str {
    SYSTEM_PROMPT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_topic_requires_hash_placeholders() {
        let entry = syntax_entry("db").expect("db topic must exist");
        let placeholders = entry
            .sections
            .get("parameter_placeholders")
            .expect("db topic must document parameter placeholders");
        assert!(placeholders.contains("#{ }"));
        assert!(placeholders.contains("${ }"));
        assert!(placeholders.contains("MUST use the `#{ }`"));
    }

    #[test]
    fn unknown_topic_is_none_and_topics_are_listed() {
        assert!(syntax_entry("nope").is_none());
        let topics = syntax_topics();
        for expected in ["basic", "db", "http", "response", "module"] {
            assert!(topics.contains(&expected), "missing topic {expected}");
        }
    }

    #[test]
    fn examples_filter_by_kind_and_keyword() {
        let db_examples = examples("db", None);
        assert!(!db_examples.is_empty());
        assert!(db_examples.iter().all(|example| example.kind == "db"));

        let filtered = examples("db", Some("transaction"));
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].code.contains("db.transaction"));

        assert!(examples("db", Some("no-such-keyword")).is_empty());
        assert!(examples("unknown-kind", None).is_empty());
    }

    #[test]
    fn workflows_expose_commands_separately() {
        let workflow = workflow("debug_api").expect("debug_api workflow must exist");
        assert!(!workflow.steps.is_empty());
        assert!(!workflow.commands.is_empty());
        assert!(workflow_tasks().contains(&"create_api"));
    }

    #[test]
    fn doc_index_topics_resolve() {
        for section in docs_index() {
            for topic in section.topics {
                assert!(syntax_entry(topic).is_some(), "dangling topic {topic}");
            }
        }
    }
}
