#![cfg(any(test, feature = "test"))]
//! Fixtures shared by unit and integration tests: a todo API declared with [`Endpoints`] and an in-memory server
//! implementing [`Transport`] that can be paused, told to fail, or told to answer with garbage.

use crate::prelude::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};
use tokio::sync::watch;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id:        u32,
    pub title:     String,
    pub completed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TodoTag {
    Todos,
    Todo(u32),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TodoQuery {
    List,
    Get(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TodoMutation {
    Add { title: String },
    Delete(u32),
    Toggle(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TodoData {
    List(Vec<Todo>),
    Todo(Todo),
    Deleted(u32),
}

impl TodoData {
    pub fn ids(&self) -> Vec<u32> {
        match self {
            Self::List(todos) => todos.iter().map(|t| t.id).collect(),
            Self::Todo(todo) => vec![todo.id],
            Self::Deleted(id) => vec![*id],
        }
    }

    pub fn titles(&self) -> Vec<&str> {
        match self {
            Self::List(todos) => todos.iter().map(|t| t.title.as_str()).collect(),
            Self::Todo(todo) => vec![todo.title.as_str()],
            Self::Deleted(_) => vec![],
        }
    }

    pub fn retain(&mut self, f: impl Fn(&Todo) -> bool) {
        if let Self::List(todos) = self {
            todos.retain(f);
        }
    }

    pub fn toggle(&mut self, id: u32) {
        match self {
            Self::List(todos) => todos
                .iter_mut()
                .filter(|t| t.id == id)
                .for_each(|t| t.completed = !t.completed),
            Self::Todo(todo) if todo.id == id => todo.completed = !todo.completed,
            _ => (),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TodoApi {
    optimistic: bool,
    options:    HashMap<TodoQuery, QueryOptions>,
}

impl TodoApi {
    /// Deletions and toggles patch cached data before the server confirms them.
    pub fn optimistic() -> Self {
        Self {
            optimistic: true,
            ..Self::default()
        }
    }

    pub fn with_options(mut self, query: TodoQuery, options: QueryOptions) -> Self {
        self.options.insert(query, options);
        self
    }
}

impl Endpoints for TodoApi {
    type Data = TodoData;
    type Mutation = TodoMutation;
    type Query = TodoQuery;
    type Tag = TodoTag;

    fn query_name(&self, query: &TodoQuery) -> &'static str {
        match query {
            TodoQuery::List => "todos",
            TodoQuery::Get(_) => "todo",
        }
    }

    fn cache_key(&self, query: &TodoQuery) -> Result<CacheKey, Error> {
        match query {
            TodoQuery::List => CacheKey::from_argument(self.query_name(query), &()),
            TodoQuery::Get(id) => CacheKey::from_argument(self.query_name(query), id),
        }
    }

    fn query_request(&self, query: &TodoQuery) -> Result<RequestDescriptor, Error> {
        Ok(match query {
            TodoQuery::List => RequestDescriptor::get("todos"),
            TodoQuery::Get(id) => RequestDescriptor::get(format!("todos/{id}")),
        })
    }

    fn decode_query(&self, query: &TodoQuery, raw: Value) -> Result<TodoData, Error> {
        Ok(match query {
            TodoQuery::List => TodoData::List(serde_json::from_value(raw)?),
            TodoQuery::Get(_) => TodoData::Todo(serde_json::from_value(raw)?),
        })
    }

    fn provides_tags(&self, query: &TodoQuery, data: Option<&TodoData>) -> Vec<TodoTag> {
        match query {
            TodoQuery::List => std::iter::once(TodoTag::Todos)
                .chain(data.into_iter().flat_map(|d| d.ids()).map(TodoTag::Todo))
                .collect(),
            TodoQuery::Get(id) => vec![TodoTag::Todo(*id)],
        }
    }

    fn mutation_request(&self, mutation: &TodoMutation) -> Result<RequestDescriptor, Error> {
        match mutation {
            TodoMutation::Add { title } => RequestDescriptor::post("todos").with_body(&json!({ "title": title })),
            TodoMutation::Delete(id) => Ok(RequestDescriptor::delete(format!("todos/{id}"))),
            TodoMutation::Toggle(id) => Ok(RequestDescriptor::patch(format!("todos/{id}"))),
        }
    }

    fn decode_mutation(&self, mutation: &TodoMutation, raw: Value) -> Result<TodoData, Error> {
        Ok(match mutation {
            TodoMutation::Add { .. } | TodoMutation::Toggle(_) => TodoData::Todo(serde_json::from_value(raw)?),
            TodoMutation::Delete(id) => TodoData::Deleted(*id),
        })
    }

    fn invalidates_tags(&self, mutation: &TodoMutation) -> Vec<TodoTag> {
        match mutation {
            TodoMutation::Add { .. } => vec![TodoTag::Todos],
            TodoMutation::Delete(id) => vec![TodoTag::Todos, TodoTag::Todo(*id)],
            TodoMutation::Toggle(id) => vec![TodoTag::Todo(*id)],
        }
    }

    fn on_mutation_start(&self, mutation: &TodoMutation) -> Vec<Effect<Self>> {
        if !self.optimistic {
            return vec![Effect::None];
        }
        match mutation {
            TodoMutation::Add { .. } => vec![Effect::None],
            TodoMutation::Delete(id) => {
                let id = *id;
                vec![
                    Effect::log(format!("deleting todo {id}")),
                    Effect::patch(TodoQuery::List, move |data: &mut TodoData| data.retain(|t| t.id != id)),
                ]
            }
            TodoMutation::Toggle(id) => {
                let id = *id;
                vec![
                    Effect::patch(TodoQuery::List, move |data: &mut TodoData| data.toggle(id)),
                    Effect::patch(TodoQuery::Get(id), move |data: &mut TodoData| data.toggle(id)),
                ]
            }
        }
    }

    fn query_options(&self, query: &TodoQuery) -> QueryOptions {
        self.options.get(query).copied().unwrap_or_default()
    }
}

/// In-memory todo backend.
#[derive(Debug)]
pub struct TodoServer {
    todos:    Mutex<Vec<Todo>>,
    next_id:  AtomicU32,
    fetches:  Mutex<HashMap<String, usize>>,
    failures: Mutex<VecDeque<Error>>,
    canned:   Mutex<VecDeque<Value>>,
    // `true` while requests are let through.
    gate:     watch::Sender<bool>,
    // Same for everything but GET.
    writes:   watch::Sender<bool>,
    arrived:  watch::Sender<usize>,
}

impl TodoServer {
    pub fn with_todos(count: u32) -> Arc<Self> {
        let todos = (1..=count)
            .map(|id| Todo {
                id,
                title: format!("todo #{id}"),
                completed: false,
            })
            .collect();
        Arc::new(Self {
            todos:    Mutex::new(todos),
            next_id:  AtomicU32::new(count + 1),
            fetches:  Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            canned:   Mutex::new(VecDeque::new()),
            gate:     watch::Sender::new(true),
            writes:   watch::Sender::new(true),
            arrived:  watch::Sender::new(0),
        })
    }

    pub fn todos(&self) -> Vec<Todo> {
        self.todos.lock().clone()
    }

    pub fn todo_count(&self) -> usize {
        self.todos.lock().len()
    }

    pub fn remove_todo(&self, id: u32) {
        self.todos.lock().retain(|t| t.id != id);
    }

    /// Number of GET requests received for `resource`.
    pub fn requests_to(&self, resource: &str) -> usize {
        self.fetches.lock().get(resource).copied().unwrap_or(0)
    }

    /// Total number of requests received, of any kind.
    pub fn request_count(&self) -> usize {
        *self.arrived.borrow()
    }

    /// Make the next request fail with `err` without touching the data.
    pub fn fail_next(&self, err: Error) {
        self.failures.lock().push_back(err);
    }

    /// Answer the next request with `value` without touching the data.
    pub fn respond_next(&self, value: Value) {
        self.canned.lock().push_back(value);
    }

    /// Hold incoming requests until [`resume()`](Self::resume) is called.
    pub fn pause(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume(&self) {
        self.gate.send_replace(true);
    }

    /// Hold mutating requests until [`resume_writes()`](Self::resume_writes) is called. Reads go through.
    pub fn pause_writes(&self) {
        self.writes.send_replace(false);
    }

    pub fn resume_writes(&self) {
        self.writes.send_replace(true);
    }

    /// Wait until at least `count` requests have arrived, including those being held.
    pub async fn wait_for_requests(&self, count: usize) {
        let mut arrived = self.arrived.subscribe();
        // The sender lives as long as the server does.
        let _ = arrived.wait_for(|n| *n >= count).await;
    }

    fn handle(&self, request: &RequestDescriptor) -> Result<Value, Error> {
        let mut segments = request.resource.splitn(2, '/');
        let (collection, id) = (segments.next(), segments.next().map(str::parse::<u32>));
        if collection != Some("todos") {
            return Err(Error::server(404, format!("no such resource: {}", request.resource)));
        }

        let mut todos = self.todos.lock();
        match (request.verb, id) {
            (Verb::Get, None) => Ok(serde_json::to_value(&*todos)?),
            (Verb::Post, None) => {
                let title = request
                    .body
                    .as_ref()
                    .and_then(|b| b.get("title"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::server(422, "title is required"))?;
                let todo = Todo {
                    id:        self.next_id.fetch_add(1, Ordering::Relaxed),
                    title:     title.to_string(),
                    completed: false,
                };
                todos.push(todo.clone());
                Ok(serde_json::to_value(todo)?)
            }
            (verb, Some(Ok(id))) => {
                let position = todos
                    .iter()
                    .position(|t| t.id == id)
                    .ok_or_else(|| Error::server(404, format!("todo {id} not found")))?;
                match verb {
                    Verb::Get => Ok(serde_json::to_value(&todos[position])?),
                    Verb::Patch => {
                        todos[position].completed = !todos[position].completed;
                        Ok(serde_json::to_value(&todos[position])?)
                    }
                    Verb::Delete => {
                        todos.remove(position);
                        Ok(Value::Null)
                    }
                    _ => Err(Error::server(405, format!("{verb} is not allowed here"))),
                }
            }
            _ => Err(Error::server(400, format!("bad request: {request}"))),
        }
    }
}

#[async_trait]
impl Transport for TodoServer {
    async fn request(&self, request: &RequestDescriptor) -> Result<Value, Error> {
        if request.verb == Verb::Get {
            *self.fetches.lock().entry(request.resource.clone()).or_default() += 1;
        }
        self.arrived.send_modify(|n| *n += 1);

        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| Error::network("server is gone"))?;
        if request.verb != Verb::Get {
            let mut writes = self.writes.subscribe();
            writes
                .wait_for(|open| *open)
                .await
                .map_err(|_| Error::network("server is gone"))?;
        }

        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        if let Some(value) = self.canned.lock().pop_front() {
            return Ok(value);
        }
        self.handle(request)
    }
}

/// A cache over `server` with default settings.
pub fn todo_cache(api: TodoApi, server: &Arc<TodoServer>) -> Arc<QueryCache<TodoApi>> {
    QueryCache::builder()
        .endpoints(api)
        .transport(Arc::clone(server) as Arc<dyn Transport>)
        .build()
        .expect("todo cache")
}

#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
