use criterion::{criterion_group, criterion_main, Criterion};
use gateway_client::cgi::CgiRequester;
use gateway_client::fastcgi::dialer::{ConnStream, Dialer, NetDialer};
use gateway_client::fastcgi::FastCgiRequester;
use gateway_client::Requester;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

fn bench_cgi_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let requester = CgiRequester::new("cat", Vec::new());

    c.bench_function("cgi_round_trip", |b| {
        b.iter(|| {
            rt.block_on(async {
                let env = Vec::new();
                let mut stdin: &[u8] = b"benchmark payload";
                let mut stdout = Vec::new();
                let mut stderr = Vec::new();
                requester
                    .request(&env, &mut stdin, &mut stdout, &mut stderr)
                    .await
                    .unwrap();
            });
        });
    });
}

fn bench_fastcgi_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let addr = rt.block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match listener.accept().await {
                    Ok(s) => s,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    loop {
                        let mut header = [0u8; 8];
                        if sock.read_exact(&mut header).await.is_err() {
                            return;
                        }
                        let request_id = u16::from_be_bytes([header[2], header[3]]);
                        let content_len = u16::from_be_bytes([header[4], header[5]]) as usize;
                        let padding_len = header[6] as usize;
                        let mut content = vec![0u8; content_len];
                        sock.read_exact(&mut content).await.unwrap();
                        let mut padding = vec![0u8; padding_len];
                        sock.read_exact(&mut padding).await.unwrap();

                        if header[1] == 5 && content.is_empty() {
                            let body = b"Content-Type: text/plain\r\n\r\nok";
                            let mut out = vec![1u8, 6];
                            out.extend_from_slice(&request_id.to_be_bytes());
                            out.extend_from_slice(&(body.len() as u16).to_be_bytes());
                            out.push(0);
                            out.push(0);
                            out.extend_from_slice(body);
                            sock.write_all(&out).await.unwrap();

                            let mut end = vec![1u8, 3];
                            end.extend_from_slice(&request_id.to_be_bytes());
                            end.extend_from_slice(&8u16.to_be_bytes());
                            end.push(0);
                            end.push(0);
                            end.extend_from_slice(&[0u8; 8]);
                            sock.write_all(&end).await.unwrap();
                            sock.flush().await.unwrap();
                            return;
                        }
                    }
                });
            }
        });
        addr
    });

    struct BenchDialer(std::net::SocketAddr);
    #[async_trait::async_trait]
    impl Dialer for BenchDialer {
        async fn dial(&self) -> tokio::io::Result<Box<dyn ConnStream>> {
            Ok(Box::new(tokio::net::TcpStream::connect(self.0).await?))
        }
    }

    let requester = FastCgiRequester::new(Box::new(BenchDialer(addr)), 8);
    let _ = NetDialer::Tcp(addr.to_string());

    c.bench_function("fastcgi_round_trip", |b| {
        b.iter(|| {
            rt.block_on(async {
                let env = Vec::new();
                let mut stdin: &[u8] = b"";
                let mut stdout = Vec::new();
                let mut stderr = Vec::new();
                requester
                    .request(&env, &mut stdin, &mut stdout, &mut stderr)
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_cgi_round_trip, bench_fastcgi_round_trip);
criterion_main!(benches);
