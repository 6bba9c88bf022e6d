//! Pipeline engine contracts: stage ordering, clone isolation, mutation
//! semantics and backpressure.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use proxy_vibes::{mod_fn, read_only_fn, ModPipeline, ReadOnlyPipeline, Request};

fn request() -> Request {
  http::Request::builder()
    .method("GET")
    .uri("http://example.test/page")
    .header("X-Original", "yes")
    .body(bytes::Bytes::from_static(b"body-bytes"))
    .unwrap()
    .into()
}

#[tokio::test]
async fn read_only_hooks_see_independent_clones() {
  let observed: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

  let hooks = (0..2)
    .map(|i| {
      let observed = observed.clone();
      read_only_fn(move |mut req: Request| {
        let observed = observed.clone();
        Box::pin(async move {
          // mutate the private clone; nobody else may observe this
          req
            .headers_mut()
            .insert("x-mutated-by", http::HeaderValue::from_str(&i.to_string()).unwrap());
          let seen = req
            .headers()
            .get("x-mutated-by")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
          observed.lock().unwrap().push(seen);
          Ok(())
        }) as futures::future::BoxFuture<'static, proxy_vibes::Result<()>>
      })
    })
    .collect();

  let pipeline = ReadOnlyPipeline::new("request_in", hooks);
  let req = request();
  pipeline.run(&req).await;

  let mut seen = observed.lock().unwrap().clone();
  seen.sort();
  // each hook saw only its own mutation
  assert_eq!(seen, vec!["0".to_string(), "1".to_string()]);
  // the original request is untouched
  assert!(req.headers().get("x-mutated-by").is_none());
}

#[tokio::test]
async fn read_only_stage_completes_before_next_stage() {
  let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

  let ev = events.clone();
  let read_only = ReadOnlyPipeline::new(
    "request_in",
    vec![read_only_fn(move |_req: Request| {
      let ev = ev.clone();
      Box::pin(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ev.lock().unwrap().push("request_in");
        Ok(())
      }) as futures::future::BoxFuture<'static, proxy_vibes::Result<()>>
    })],
  );

  let ev = events.clone();
  let mutation = ModPipeline::new(
    "request_mod",
    vec![mod_fn(move |req: Request| {
      let ev = ev.clone();
      Box::pin(async move {
        ev.lock().unwrap().push("request_mod");
        Ok(req)
      }) as futures::future::BoxFuture<'static, proxy_vibes::Result<Request>>
    })],
  );

  let req = request();
  read_only.run(&req).await;
  let _ = mutation.run(req).await.unwrap();

  assert_eq!(*events.lock().unwrap(), vec!["request_in", "request_mod"]);
}

#[tokio::test]
async fn identity_mutation_is_a_no_op() {
  let pipeline = ModPipeline::new(
    "request_mod",
    vec![mod_fn(|req: Request| {
      Box::pin(async move { Ok(req) })
        as futures::future::BoxFuture<'static, proxy_vibes::Result<Request>>
    })],
  );

  let req = request();
  let before = req.to_raw();
  let after = pipeline.run(req).await.unwrap();
  assert_eq!(before, after.to_raw());
}

#[tokio::test]
async fn mutation_error_aborts_the_exchange() {
  let ran_after: Arc<Mutex<bool>> = Arc::new(Mutex::new(false));
  let flag = ran_after.clone();
  let pipeline = ModPipeline::new(
    "request_mod",
    vec![
      mod_fn(|_req: Request| {
        Box::pin(async move { Err(proxy_vibes::Error::hook("nope")) })
          as futures::future::BoxFuture<'static, proxy_vibes::Result<Request>>
      }),
      mod_fn(move |req: Request| {
        let flag = flag.clone();
        Box::pin(async move {
          *flag.lock().unwrap() = true;
          Ok(req)
        }) as futures::future::BoxFuture<'static, proxy_vibes::Result<Request>>
      }),
    ],
  );

  assert!(pipeline.run(request()).await.is_err());
  assert!(!*ran_after.lock().unwrap());
}

#[tokio::test]
async fn body_is_readable_from_zero_after_each_mutation() {
  let pipeline = ModPipeline::new(
    "request_mod",
    vec![
      // consumes the body cursor
      mod_fn(|mut req: Request| {
        Box::pin(async move {
          if let Some(body) = req.body_mut().as_mut() {
            let mut sink = [0u8; 64];
            while body.read(&mut sink) > 0 {}
          }
          Ok(req)
        }) as futures::future::BoxFuture<'static, proxy_vibes::Result<Request>>
      }),
      // must still see the body from position zero
      mod_fn(|mut req: Request| {
        Box::pin(async move {
          let body = req.body_mut().as_mut().expect("body present");
          assert_eq!(body.position(), 0);
          assert_eq!(body.remaining(), b"body-bytes");
          Ok(req)
        }) as futures::future::BoxFuture<'static, proxy_vibes::Result<Request>>
      }),
      // replaces the body outright
      mod_fn(|mut req: Request| {
        Box::pin(async move {
          *req.body_mut() = Some(proxy_vibes::Body::from("replaced".to_string()));
          Ok(req)
        }) as futures::future::BoxFuture<'static, proxy_vibes::Result<Request>>
      }),
      // the replacement is canonical and readable from zero
      mod_fn(|mut req: Request| {
        Box::pin(async move {
          let body = req.body_mut().as_mut().expect("body present");
          assert_eq!(body.position(), 0);
          assert_eq!(body.remaining(), b"replaced");
          Ok(req)
        }) as futures::future::BoxFuture<'static, proxy_vibes::Result<Request>>
      }),
    ],
  );

  let result = pipeline.run(request()).await.unwrap();
  assert_eq!(result.body().unwrap().bytes().as_ref(), b"replaced");
}

#[tokio::test]
async fn full_queue_drops_without_failing_the_caller() {
  let gate = Arc::new(tokio::sync::Semaphore::new(0));

  let permit_gate = gate.clone();
  let pipeline = Arc::new(ReadOnlyPipeline::new(
    "request_in",
    vec![read_only_fn(move |_req: Request| {
      let gate = permit_gate.clone();
      Box::pin(async move {
        let _permit = gate.acquire().await;
        Ok(())
      }) as futures::future::BoxFuture<'static, proxy_vibes::Result<()>>
    })],
  ));

  // saturate the worker and the queue
  let mut tasks = Vec::new();
  for _ in 0..1030 {
    let pipeline = pipeline.clone();
    tasks.push(tokio::spawn(async move {
      pipeline.run(&request()).await;
    }));
  }
  tokio::time::sleep(Duration::from_millis(100)).await;

  // the stage is saturated: this call must drop the item and return
  // promptly instead of blocking the exchange
  let result = tokio::time::timeout(Duration::from_secs(1), pipeline.run(&request())).await;
  assert!(result.is_ok(), "run() must not block when the queue is full");

  gate.add_permits(2000);
  for task in tasks {
    task.await.unwrap();
  }
}

#[tokio::test]
async fn hook_swap_applies_to_subsequent_runs() {
  let counter = Arc::new(Mutex::new(0u32));
  let pipeline: ReadOnlyPipeline<Request> = ReadOnlyPipeline::new("request_out", Vec::new());

  let seen = counter.clone();
  pipeline.set_hooks(vec![read_only_fn(move |_req: Request| {
    let seen = seen.clone();
    Box::pin(async move {
      *seen.lock().unwrap() += 1;
      Ok(())
    }) as futures::future::BoxFuture<'static, proxy_vibes::Result<()>>
  })]);

  pipeline.run(&request()).await;
  assert_eq!(*counter.lock().unwrap(), 1);

  pipeline.set_hooks(Vec::new());
  pipeline.run(&request()).await;
  assert_eq!(*counter.lock().unwrap(), 1);
}

#[tokio::test]
async fn read_only_hook_error_does_not_fail_the_exchange() {
  let pipeline = ReadOnlyPipeline::new(
    "response_in",
    vec![read_only_fn(|_req: Request| {
      Box::pin(async move { Err(proxy_vibes::Error::hook("observer failed")) })
        as futures::future::BoxFuture<'static, proxy_vibes::Result<()>>
    })],
  );
  // completes without propagating the hook failure
  pipeline.run(&request()).await;
}
